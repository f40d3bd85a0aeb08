//! Typed error hierarchy for the provisioning coordinator.
//!
//! Two enums cover the two layers:
//! - `ChannelError`: failures talking to a spawned login process
//! - `ProvisionError`: everything a caller of the driver can observe

use thiserror::Error;

use crate::registry::Stage;

/// Errors from a single [`ProcessChannel`](crate::channel::ProcessChannel).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process input is closed")]
    Closed,
}

/// Errors surfaced by the conversation driver and its collaborators.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("A conversation for {key} is already pending")]
    AlreadyPending { key: String },

    #[error("No pending conversation for {key}")]
    NotFound { key: String },

    #[error("Conversation for {key} is {actual}, expected {expected}")]
    StageMismatch {
        key: String,
        expected: Stage,
        actual: Stage,
    },

    #[error(transparent)]
    ProcessSpawnFailed(ChannelError),

    #[error("Login process exited before prompting (status {status:?}): {reason}")]
    ProcessExitedEarly { status: Option<i32>, reason: String },

    #[error("Verification failed: {reason}")]
    ProcessFailed { status: Option<i32>, reason: String },

    #[error("Login process for {key} stopped accepting input")]
    ChannelClosed { key: String },

    #[error("Conversation for {key} timed out after {secs}s")]
    Timeout { key: String, secs: u64 },

    #[error("Session file not found at {path}")]
    ArtifactMissing { path: std::path::PathBuf },

    #[error("Failed to read session file at {path}: {source}")]
    ArtifactUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Conversation task for {key} failed during {operation}: {reason}")]
    TaskFailed {
        key: String,
        operation: &'static str,
        reason: String,
    },
}

impl ProvisionError {
    /// Short machine-readable name of the variant, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "validation",
            ProvisionError::AlreadyPending { .. } => "already_pending",
            ProvisionError::NotFound { .. } => "not_found",
            ProvisionError::StageMismatch { .. } => "stage_mismatch",
            ProvisionError::ProcessSpawnFailed(_) => "process_spawn_failed",
            ProvisionError::ProcessExitedEarly { .. } => "process_exited_early",
            ProvisionError::ProcessFailed { .. } => "process_failed",
            ProvisionError::ChannelClosed { .. } => "channel_closed",
            ProvisionError::Timeout { .. } => "timeout",
            ProvisionError::ArtifactMissing { .. } => "artifact_missing",
            ProvisionError::ArtifactUnreadable { .. } => "artifact_unreadable",
            ProvisionError::TaskFailed { .. } => "task_failed",
        }
    }
}
