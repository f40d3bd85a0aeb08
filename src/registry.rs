//! In-flight conversations keyed by phone number.
//!
//! The registry is an explicitly owned object shared through `Arc`; tests
//! construct isolated instances. Map operations are atomic per shard and never
//! held across an await. Each conversation carries its own async mutex, which
//! serializes start/submit/teardown for that key without blocking other keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::ProcessChannel;
use crate::errors::ProvisionError;
use crate::guard::TimeoutGuard;
use crate::transcript::Transcript;

/// Which caller input a conversation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Process launched, no prompt seen yet.
    Spawning,
    AwaitingCode,
    AwaitingPassword,
    /// Success seen, artifact handoff in progress.
    Finalizing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Spawning => write!(f, "spawning"),
            Stage::AwaitingCode => write!(f, "awaiting_code"),
            Stage::AwaitingPassword => write!(f, "awaiting_password"),
            Stage::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// One provisioning attempt in flight.
pub struct PendingConversation {
    key: String,
    id: Uuid,
    channel: ProcessChannel,
    transcript: Transcript,
    stage: Stage,
    started_at: DateTime<Utc>,
    deadline: Instant,
    guard: Option<TimeoutGuard>,
    closed: bool,
}

impl PendingConversation {
    pub fn new(key: impl Into<String>, channel: ProcessChannel, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            id: Uuid::new_v4(),
            channel,
            transcript: Transcript::new(),
            stage: Stage::Spawning,
            started_at: Utc::now(),
            deadline: Instant::now() + timeout,
            guard: None,
            closed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn channel(&self) -> &ProcessChannel {
        &self.channel
    }

    pub(crate) fn channel_mut(&mut self) -> &mut ProcessChannel {
        &mut self.channel
    }

    pub(crate) fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub(crate) fn arm(&mut self, guard: TimeoutGuard) {
        self.guard = Some(guard);
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(guard) = &self.guard {
            guard.disarm();
        }
    }

    /// Mark finalized: disarm the guard and terminate the process.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.disarm();
        self.channel.terminate();
    }
}

/// Snapshot of a pending conversation for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub phone_number: String,
    pub conversation_id: Uuid,
    /// `None` while a request is actively driving the conversation.
    pub stage: Option<Stage>,
    pub started_at: DateTime<Utc>,
}

pub type ConversationHandle = Arc<Mutex<PendingConversation>>;

/// Identity kept beside the handle so listings never wait on a busy lock.
struct Entry {
    handle: ConversationHandle,
    id: Uuid,
    started_at: DateTime<Utc>,
}

/// Thread-safe map from phone number to pending conversation.
#[derive(Default)]
pub struct PendingRegistry {
    entries: DashMap<String, Entry>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically create the conversation for `key` unless one is pending.
    ///
    /// `make` runs while the key's shard is write-locked, so two concurrent
    /// calls for the same key can never both spawn a process. It must not
    /// touch the registry.
    pub fn insert_with<F>(&self, key: &str, make: F) -> Result<ConversationHandle, ProvisionError>
    where
        F: FnOnce() -> Result<PendingConversation, ProvisionError>,
    {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Err(ProvisionError::AlreadyPending {
                key: key.to_string(),
            }),
            MapEntry::Vacant(slot) => {
                let conversation = make()?;
                let id = conversation.id();
                let started_at = conversation.started_at();
                let handle = Arc::new(Mutex::new(conversation));
                slot.insert(Entry {
                    handle: Arc::clone(&handle),
                    id,
                    started_at,
                });
                Ok(handle)
            }
        }
    }

    pub fn insert(
        &self,
        conversation: PendingConversation,
    ) -> Result<ConversationHandle, ProvisionError> {
        let key = conversation.key().to_string();
        self.insert_with(&key, move || Ok(conversation))
    }

    pub fn get(&self, key: &str) -> Result<ConversationHandle, ProvisionError> {
        self.entries
            .get(key)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| ProvisionError::NotFound {
                key: key.to_string(),
            })
    }

    /// Remove whatever is registered under `key`. Idempotent.
    pub fn remove(&self, key: &str) -> Option<ConversationHandle> {
        self.entries.remove(key).map(|(_, entry)| entry.handle)
    }

    /// Remove `key` only if it still maps to `handle`, so a late teardown of
    /// an old conversation never evicts a newer one.
    pub fn remove_if_same(&self, key: &str, handle: &ConversationHandle) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(&current.handle, handle))
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One summary per entry, sorted by key. Stage is `None` for a
    /// conversation whose lock is currently held.
    pub fn summaries(&self) -> Vec<PendingSummary> {
        let mut summaries: Vec<PendingSummary> = self
            .entries
            .iter()
            .map(|e| PendingSummary {
                phone_number: e.key().clone(),
                conversation_id: e.id,
                stage: e.handle.try_lock().ok().map(|conv| conv.stage()),
                started_at: e.started_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.phone_number.cmp(&b.phone_number));
        summaries
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(String, ConversationHandle)> {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|(key, entry)| (key, entry.handle))
            .collect()
    }
}
