//! The provisioning state machine.
//!
//! A conversation is started by one call and continued by later ones. Each
//! call locks the conversation, writes to the login process, and blocks until
//! the process prints something meaningful, exits, or the conversation's
//! absolute deadline passes.
//!
//! Every operation runs on its own spawned task and the caller only awaits
//! the result. A caller that goes away mid-call (a dropped HTTP request) does
//! not stop the state machine: the stage still advances, and a later call
//! sees a consistent conversation.
//!
//! ```text
//! Spawning --code prompt--> AwaitingCode --2FA prompt--> AwaitingPassword
//!    |                           |                            |
//!    +-------- success ----------+--------- success ----------+--> Finalizing --> removed
//! ```

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::artifact::{Artifact, ArtifactHandoff};
use crate::channel::{ChannelEvent, LaunchSpec, ProcessChannel};
use crate::config::ProvisionConfig;
use crate::errors::ProvisionError;
use crate::guard::{GuardTrigger, TimeoutGuard};
use crate::registry::{
    ConversationHandle, PendingConversation, PendingRegistry, PendingSummary, Stage,
};
use crate::transcript::{Marker, MarkerSet};

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{5,20}$").unwrap());

const START_EXPECTS: [Marker; 3] = [Marker::Failure, Marker::Success, Marker::CodeRequest];
const CODE_EXPECTS: [Marker; 3] = [Marker::Failure, Marker::Success, Marker::TwoFactor];
const PASSWORD_EXPECTS: [Marker; 2] = [Marker::Failure, Marker::Success];

/// How long a failed write waits for the process to report its exit.
/// Covers the channel's own reader drain.
const EXIT_AFTER_WRITE_FAILURE: Duration = Duration::from_secs(1);

/// Result of [`ConversationDriver::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The login program asked for a verification code.
    WaitingForCode,
    /// The account was already authorized and the session file is ready.
    Completed(Artifact),
}

/// Result of submitting a code or a second-factor password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The account has two-factor authentication; a password is required.
    NeedsSecondFactor,
    Completed(Artifact),
}

/// What a bounded wait on the process produced.
#[derive(Debug)]
enum Observed {
    Marker(Marker),
    Exited(i32),
    TimedOut,
}

/// How the process ended after printing its success marker.
#[derive(Debug)]
enum Settled {
    Exited(i32),
    Failed,
    StillRunning,
}

/// Drives login conversations. Clones share the same registry.
#[derive(Clone)]
pub struct ConversationDriver {
    core: Arc<DriverCore>,
}

/// State shared by the driver and the tasks it spawns.
struct DriverCore {
    registry: Arc<PendingRegistry>,
    handoff: Arc<ArtifactHandoff>,
    launch: LaunchSpec,
    markers: MarkerSet,
    timeout: Duration,
}

impl ConversationDriver {
    pub fn new(
        registry: Arc<PendingRegistry>,
        handoff: ArtifactHandoff,
        launch: LaunchSpec,
        markers: MarkerSet,
        timeout: Duration,
    ) -> Self {
        Self {
            core: Arc::new(DriverCore {
                registry,
                handoff: Arc::new(handoff),
                launch,
                markers,
                timeout,
            }),
        }
    }

    /// Build a driver with a fresh registry from loaded configuration.
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self::new(
            Arc::new(PendingRegistry::new()),
            config.handoff(),
            config.launch_spec(),
            config.toml.markers.clone(),
            config.timeout(),
        )
    }

    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.core.registry
    }

    /// Launch the login program for `phone` and wait for its first prompt.
    pub async fn start(&self, phone: &str) -> Result<StartOutcome, ProvisionError> {
        let key = validate_phone(phone)?;
        self.detached("start", key, |core, key| async move { core.start(key).await })
            .await
    }

    /// Send the verification code. When `password` is given and the program
    /// asks for a second factor, it is forwarded in the same call.
    pub async fn submit_code(
        &self,
        phone: &str,
        code: &str,
        password: Option<&str>,
    ) -> Result<SubmitOutcome, ProvisionError> {
        let key = validate_phone(phone)?;
        validate_secret("verification code", code)?;
        if let Some(password) = password {
            validate_secret("password", password)?;
        }

        let code = code.trim().to_string();
        let password = password.map(str::to_string);
        self.detached("submit_code", key, |core, key| async move {
            core.submit_code(key, code, password).await
        })
        .await
    }

    /// Send the two-factor password for a conversation that asked for one.
    pub async fn submit_second_factor(
        &self,
        phone: &str,
        password: &str,
    ) -> Result<SubmitOutcome, ProvisionError> {
        let key = validate_phone(phone)?;
        validate_secret("password", password)?;

        let password = password.to_string();
        self.detached("submit_second_factor", key, |core, key| async move {
            core.submit_second_factor(key, password).await
        })
        .await
    }

    /// Remove and terminate the conversation for `phone`.
    ///
    /// A request currently driving the conversation finishes first.
    pub async fn cancel(&self, phone: &str) -> Result<(), ProvisionError> {
        let key = validate_phone(phone)?;
        self.detached("cancel", key, |core, key| async move { core.cancel(key).await })
            .await
    }

    /// Conversations currently in flight, sorted by phone number.
    pub fn pending(&self) -> Vec<PendingSummary> {
        self.core.registry.summaries()
    }

    /// Tear down every pending conversation.
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }

    /// Run one operation on its own task and wait for it.
    async fn detached<T, F, Fut>(
        &self,
        operation: &'static str,
        key: String,
        op: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnOnce(Arc<DriverCore>, String) -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(op(Arc::clone(&self.core), key.clone()));
        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(phone = %key, operation, error = %join_err, "Conversation task panicked");
                Err(ProvisionError::TaskFailed {
                    key,
                    operation,
                    reason: join_err.to_string(),
                })
            }
        }
    }
}

impl DriverCore {
    async fn start(self: Arc<Self>, key: String) -> Result<StartOutcome, ProvisionError> {
        let handle = self.registry.insert_with(&key, || {
            let channel = ProcessChannel::spawn(&self.launch, &key)
                .map_err(ProvisionError::ProcessSpawnFailed)?;
            Ok(PendingConversation::new(&key, channel, self.timeout))
        })?;

        let mut conv = handle.lock().await;
        info!(
            phone = %key,
            conversation = %conv.id(),
            pid = ?conv.channel().pid(),
            "Started login conversation"
        );
        self.arm_guard(&handle, &mut conv);

        match self.observe(&mut conv, &START_EXPECTS).await {
            Observed::Marker(Marker::Failure) => {
                let reason = conv.transcript().failure_reason();
                let err = ProvisionError::ProcessExitedEarly {
                    status: None,
                    reason,
                };
                Err(self.abort(&handle, &mut conv, err).await)
            }
            Observed::Marker(Marker::Success) => self
                .conclude(&handle, &mut conv, None)
                .await
                .map(StartOutcome::Completed),
            // The code prompt is the only other marker expected here.
            Observed::Marker(_) => {
                conv.set_stage(Stage::AwaitingCode);
                info!(phone = %key, conversation = %conv.id(), stage = %conv.stage(), "Waiting for verification code");
                Ok(StartOutcome::WaitingForCode)
            }
            Observed::Exited(0) => {
                debug!(phone = %key, "Login program exited cleanly without prompting");
                self.conclude(&handle, &mut conv, Some(0))
                    .await
                    .map(StartOutcome::Completed)
            }
            Observed::Exited(code) => {
                let err = ProvisionError::ProcessExitedEarly {
                    status: Some(code),
                    reason: conv.transcript().failure_reason(),
                };
                Err(self.abort(&handle, &mut conv, err).await)
            }
            Observed::TimedOut => {
                let err = self.timeout_error(&key);
                Err(self.abort(&handle, &mut conv, err).await)
            }
        }
    }

    async fn submit_code(
        self: Arc<Self>,
        key: String,
        code: String,
        password: Option<String>,
    ) -> Result<SubmitOutcome, ProvisionError> {
        let handle = self.registry.get(&key)?;
        let mut conv = handle.lock().await;
        check_stage(&key, &conv, Stage::AwaitingCode)?;
        self.send(&handle, &mut conv, &code).await?;
        debug!(
            phone = %key,
            conversation = %conv.id(),
            remaining_ms = conv.remaining().as_millis() as u64,
            "Submitted verification code"
        );

        match self.observe(&mut conv, &CODE_EXPECTS).await {
            Observed::Marker(Marker::Failure) => {
                let err = ProvisionError::ProcessFailed {
                    status: None,
                    reason: conv.transcript().failure_reason(),
                };
                Err(self.abort(&handle, &mut conv, err).await)
            }
            Observed::Marker(Marker::Success) => self
                .conclude(&handle, &mut conv, None)
                .await
                .map(SubmitOutcome::Completed),
            Observed::Marker(_) => match password {
                Some(password) => {
                    debug!(phone = %key, "Second factor requested, forwarding supplied password");
                    self.send(&handle, &mut conv, &password).await?;
                    self.await_password_result(&handle, &mut conv).await
                }
                None => {
                    conv.set_stage(Stage::AwaitingPassword);
                    info!(phone = %key, conversation = %conv.id(), stage = %conv.stage(), "Waiting for second factor");
                    Ok(SubmitOutcome::NeedsSecondFactor)
                }
            },
            Observed::Exited(code) => {
                let err = ProvisionError::ProcessFailed {
                    status: Some(code),
                    reason: conv.transcript().failure_reason(),
                };
                Err(self.abort(&handle, &mut conv, err).await)
            }
            Observed::TimedOut => {
                let err = self.timeout_error(&key);
                Err(self.abort(&handle, &mut conv, err).await)
            }
        }
    }

    async fn submit_second_factor(
        self: Arc<Self>,
        key: String,
        password: String,
    ) -> Result<SubmitOutcome, ProvisionError> {
        let handle = self.registry.get(&key)?;
        let mut conv = handle.lock().await;
        check_stage(&key, &conv, Stage::AwaitingPassword)?;
        self.send(&handle, &mut conv, &password).await?;
        debug!(
            phone = %key,
            conversation = %conv.id(),
            remaining_ms = conv.remaining().as_millis() as u64,
            "Submitted second factor"
        );

        self.await_password_result(&handle, &mut conv).await
    }

    async fn cancel(self: Arc<Self>, key: String) -> Result<(), ProvisionError> {
        let handle = self
            .registry
            .remove(&key)
            .ok_or_else(|| ProvisionError::NotFound { key: key.clone() })?;

        let mut conv = handle.lock().await;
        if !conv.is_closed() {
            info!(phone = %key, conversation = %conv.id(), stage = %conv.stage(), "Cancelled login conversation");
            teardown(&self.registry, &self.handoff, &handle, &mut conv).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let drained = self.registry.drain();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Terminating pending login conversations");
        for (key, handle) in drained {
            let mut conv = handle.lock().await;
            if !conv.is_closed() {
                debug!(phone = %key, stage = %conv.stage(), "Terminating on shutdown");
                teardown(&self.registry, &self.handoff, &handle, &mut conv).await;
            }
        }
    }

    async fn await_password_result(
        &self,
        handle: &ConversationHandle,
        conv: &mut PendingConversation,
    ) -> Result<SubmitOutcome, ProvisionError> {
        match self.observe(conv, &PASSWORD_EXPECTS).await {
            Observed::Marker(Marker::Success) => self
                .conclude(handle, conv, None)
                .await
                .map(SubmitOutcome::Completed),
            Observed::Marker(_) => {
                let err = ProvisionError::ProcessFailed {
                    status: None,
                    reason: conv.transcript().failure_reason(),
                };
                Err(self.abort(handle, conv, err).await)
            }
            Observed::Exited(code) => {
                let err = ProvisionError::ProcessFailed {
                    status: Some(code),
                    reason: conv.transcript().failure_reason(),
                };
                Err(self.abort(handle, conv, err).await)
            }
            Observed::TimedOut => {
                let err = self.timeout_error(conv.key());
                Err(self.abort(handle, conv, err).await)
            }
        }
    }

    /// Read process events until an expected marker, exit, or the deadline.
    async fn observe(&self, conv: &mut PendingConversation, expected: &[Marker]) -> Observed {
        let deadline = conv.deadline();
        loop {
            let event =
                match tokio::time::timeout_at(deadline, conv.channel_mut().next_event()).await {
                    Err(_) => return Observed::TimedOut,
                    // Senders only go away after the exit event was consumed.
                    Ok(None) => return Observed::Exited(-1),
                    Ok(Some(event)) => event,
                };

            match event {
                ChannelEvent::Stdout(text) => {
                    trace!(phone = %conv.key(), output = %text, "stdout");
                    conv.transcript_mut().push_stdout(&text);
                    if let Some(marker) = conv.transcript_mut().scan(&self.markers, expected) {
                        debug!(phone = %conv.key(), marker = %marker, stage = %conv.stage(), "Marker detected");
                        return Observed::Marker(marker);
                    }
                }
                ChannelEvent::Stderr(text) => {
                    trace!(phone = %conv.key(), output = %text, "stderr");
                    conv.transcript_mut().push_stderr(&text);
                }
                ChannelEvent::Exited(code) => {
                    debug!(phone = %conv.key(), exit_code = code, stage = %conv.stage(), "Login process exited");
                    return Observed::Exited(code);
                }
            }
        }
    }

    /// Finish a successful conversation: let the process exit, pick up the
    /// session file, and tear down whatever the outcome.
    async fn conclude(
        &self,
        handle: &ConversationHandle,
        conv: &mut PendingConversation,
        exit: Option<i32>,
    ) -> Result<Artifact, ProvisionError> {
        conv.set_stage(Stage::Finalizing);
        conv.disarm();
        let key = conv.key().to_string();

        let settled = match exit {
            Some(code) => Settled::Exited(code),
            None => self.settle(conv).await,
        };
        let result = match settled {
            Settled::Failed => Err(ProvisionError::ProcessFailed {
                status: None,
                reason: conv.transcript().failure_reason(),
            }),
            Settled::Exited(code) if code != 0 => Err(ProvisionError::ProcessFailed {
                status: Some(code),
                reason: conv.transcript().failure_reason(),
            }),
            Settled::Exited(_) => self.handoff.collect(&key).await,
            Settled::StillRunning => {
                warn!(phone = %key, "Login process still running after success, collecting anyway");
                self.handoff.collect(&key).await
            }
        };

        teardown(&self.registry, &self.handoff, handle, conv).await;
        match &result {
            Ok(artifact) => info!(
                phone = %key,
                conversation = %conv.id(),
                size = artifact.size,
                "Session file delivered"
            ),
            Err(e) => warn!(phone = %key, conversation = %conv.id(), error = %e, "Login conversation failed"),
        }
        result
    }

    /// Wait for the process to exit after its success marker, watching for a
    /// late failure marker. Bounded by the conversation deadline.
    async fn settle(&self, conv: &mut PendingConversation) -> Settled {
        let deadline = conv.deadline();
        loop {
            let event =
                match tokio::time::timeout_at(deadline, conv.channel_mut().next_event()).await {
                    Err(_) => return Settled::StillRunning,
                    Ok(None) => return Settled::Exited(-1),
                    Ok(Some(event)) => event,
                };
            match event {
                ChannelEvent::Stdout(text) => {
                    trace!(phone = %conv.key(), output = %text, "stdout");
                    conv.transcript_mut().push_stdout(&text);
                    if conv
                        .transcript_mut()
                        .scan(&self.markers, &[Marker::Failure])
                        .is_some()
                    {
                        return Settled::Failed;
                    }
                }
                ChannelEvent::Stderr(text) => {
                    trace!(phone = %conv.key(), output = %text, "stderr");
                    conv.transcript_mut().push_stderr(&text);
                }
                ChannelEvent::Exited(code) => return Settled::Exited(code),
            }
        }
    }

    /// Write one line to the process. A failed write ends the conversation.
    async fn send(
        &self,
        handle: &ConversationHandle,
        conv: &mut PendingConversation,
        text: &str,
    ) -> Result<(), ProvisionError> {
        if conv.channel_mut().write_line(text).await.is_ok() {
            return Ok(());
        }

        // The process is usually gone by now, but its last output and exit
        // status may still be in flight from the readers.
        let limit = conv
            .deadline()
            .min(Instant::now() + EXIT_AFTER_WRITE_FAILURE);
        let mut status = None;
        while let Ok(Some(event)) =
            tokio::time::timeout_at(limit, conv.channel_mut().next_event()).await
        {
            match event {
                ChannelEvent::Stdout(text) => conv.transcript_mut().push_stdout(&text),
                ChannelEvent::Stderr(text) => conv.transcript_mut().push_stderr(&text),
                ChannelEvent::Exited(code) => {
                    status = Some(code);
                    break;
                }
            }
        }
        let err = if status.is_some() || !conv.channel().is_running() {
            ProvisionError::ProcessFailed {
                status,
                reason: conv.transcript().failure_reason(),
            }
        } else {
            ProvisionError::ChannelClosed {
                key: conv.key().to_string(),
            }
        };
        Err(self.abort(handle, conv, err).await)
    }

    /// Tear down after a terminal error and hand the error back.
    async fn abort(
        &self,
        handle: &ConversationHandle,
        conv: &mut PendingConversation,
        err: ProvisionError,
    ) -> ProvisionError {
        warn!(
            phone = %conv.key(),
            conversation = %conv.id(),
            stage = %conv.stage(),
            error = %err,
            "Login conversation failed"
        );
        teardown(&self.registry, &self.handoff, handle, conv).await;
        err
    }

    fn timeout_error(&self, key: &str) -> ProvisionError {
        ProvisionError::Timeout {
            key: key.to_string(),
            secs: self.timeout.as_secs(),
        }
    }

    /// Tear the conversation down at its deadline, or as soon as its process
    /// exits while no request is driving it.
    fn arm_guard(&self, handle: &ConversationHandle, conv: &mut PendingConversation) {
        let weak = Arc::downgrade(handle);
        let registry = Arc::clone(&self.registry);
        let handoff = Arc::clone(&self.handoff);
        let guard = TimeoutGuard::arm(
            conv.deadline(),
            conv.channel().exit_signal(),
            move |trigger| async move {
                let Some(handle) = weak.upgrade() else {
                    return;
                };
                let mut conv = handle.lock().await;
                if conv.is_closed() {
                    return;
                }
                match trigger {
                    GuardTrigger::Deadline => warn!(
                        phone = %conv.key(),
                        conversation = %conv.id(),
                        stage = %conv.stage(),
                        "Login conversation timed out"
                    ),
                    GuardTrigger::ProcessExited => warn!(
                        phone = %conv.key(),
                        conversation = %conv.id(),
                        stage = %conv.stage(),
                        "Login process exited while waiting for input"
                    ),
                }
                teardown(&registry, &handoff, &handle, &mut conv).await;
            },
        );
        conv.arm(guard);
    }
}

/// Close the conversation, unregister it, and delete any leftover artifact.
async fn teardown(
    registry: &PendingRegistry,
    handoff: &ArtifactHandoff,
    handle: &ConversationHandle,
    conv: &mut PendingConversation,
) {
    conv.close();
    registry.remove_if_same(conv.key(), handle);
    handoff.discard(conv.key()).await;
}

fn check_stage(
    key: &str,
    conv: &PendingConversation,
    expected: Stage,
) -> Result<(), ProvisionError> {
    // A teardown may have won the lock first.
    if conv.is_closed() {
        return Err(ProvisionError::NotFound {
            key: key.to_string(),
        });
    }
    if conv.stage() != expected {
        return Err(ProvisionError::StageMismatch {
            key: key.to_string(),
            expected,
            actual: conv.stage(),
        });
    }
    Ok(())
}

/// Trim and check a phone number. The result is used as the registry key and
/// inside the artifact path.
pub fn validate_phone(phone: &str) -> Result<String, ProvisionError> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(ProvisionError::Validation(
            "Phone number is required".to_string(),
        ));
    }
    if !PHONE_PATTERN.is_match(phone) {
        return Err(ProvisionError::Validation(format!(
            "Invalid phone number '{}': expected an optional '+' followed by 5-20 digits",
            phone
        )));
    }
    Ok(phone.to_string())
}

fn validate_secret(what: &str, value: &str) -> Result<(), ProvisionError> {
    if value.trim().is_empty() {
        return Err(ProvisionError::Validation(format!("A {} is required", what)));
    }
    if value.contains(['\n', '\r']) {
        return Err(ProvisionError::Validation(format!(
            "The {} must be a single line",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::RetryPolicy;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn driver_for(script: &str, dir: &TempDir, timeout: Duration) -> ConversationDriver {
        let launch = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            working_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
        };
        let handoff = ArtifactHandoff::new(
            dir.path().join("sessions"),
            "session",
            Duration::ZERO,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
            },
        );
        ConversationDriver::new(
            Arc::new(PendingRegistry::new()),
            handoff,
            launch,
            MarkerSet::default(),
            timeout,
        )
    }

    /// Poll until the conversation for `phone` reports `stage`.
    async fn wait_for_stage(driver: &ConversationDriver, phone: &str, stage: Stage) {
        for _ in 0..100 {
            let current = driver
                .pending()
                .into_iter()
                .find(|p| p.phone_number == phone)
                .and_then(|p| p.stage);
            if current == Some(stage) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("Conversation for {} never reached {}", phone, stage);
    }

    #[test]
    fn test_validate_phone() {
        assert_eq!(validate_phone(" +15550001 ").unwrap(), "+15550001");
        assert_eq!(validate_phone("15550001").unwrap(), "15550001");
        assert!(matches!(
            validate_phone(""),
            Err(ProvisionError::Validation(_))
        ));
        assert!(validate_phone("+1 555 0001").is_err());
        assert!(validate_phone("../../etc/passwd").is_err());
        assert!(validate_phone("+1234").is_err());
        assert!(validate_phone("+123456789012345678901").is_err());
    }

    #[test]
    fn test_validate_secret() {
        assert!(validate_secret("code", "12345").is_ok());
        assert!(validate_secret("code", "  ").is_err());
        assert!(validate_secret("code", "123\n45").is_err());
    }

    #[tokio::test]
    async fn test_start_waits_for_code_prompt() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for(
            "printf 'Enter the verification code: '; read code",
            &dir,
            Duration::from_secs(10),
        );
        let outcome = driver.start("+15550001").await.unwrap();
        assert_eq!(outcome, StartOutcome::WaitingForCode);
        assert_eq!(driver.pending().len(), 1);
        assert_eq!(driver.pending()[0].stage, Some(Stage::AwaitingCode));
        driver.shutdown().await;
        assert!(driver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_phone_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for("exit 0", &dir, Duration::from_secs(10));
        let err = driver.start("not-a-phone").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        assert!(driver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failure_marker_during_start() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for(
            "echo '[ERROR] Phone number banned'; echo '[FAILED] Session generation failed'; sleep 5",
            &dir,
            Duration::from_secs(10),
        );
        match driver.start("+15550001").await {
            Err(ProvisionError::ProcessExitedEarly { status, reason }) => {
                assert_eq!(status, None);
                assert!(reason.contains("Phone number banned"));
            }
            other => panic!("Expected ProcessExitedEarly, got {:?}", other),
        }
        assert!(driver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_submit_without_conversation_is_not_found() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for("exit 0", &dir, Duration::from_secs(10));
        let err = driver
            .submit_code("+15550001", "12345", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_removes_and_second_cancel_is_not_found() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for(
            "printf 'Enter the verification code: '; read code",
            &dir,
            Duration::from_secs(10),
        );
        driver.start("+15550001").await.unwrap();
        driver.cancel("+15550001").await.unwrap();
        assert!(driver.registry().is_empty());
        assert!(matches!(
            driver.cancel("+15550001").await,
            Err(ProvisionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_process_exit_removes_conversation() {
        let dir = TempDir::new().unwrap();
        // Prompts, then quits without waiting for input.
        let driver = driver_for(
            "printf 'Enter the verification code: '; sleep 0.2",
            &dir,
            Duration::from_secs(10),
        );
        driver.start("+15550001").await.unwrap();
        for _ in 0..100 {
            if driver.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(driver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_start_still_reaches_code_prompt() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for(
            "sleep 0.5; printf 'Enter the verification code: '; read code; echo \"[ERROR] got $code\"; echo '[FAILED]'",
            &dir,
            Duration::from_secs(10),
        );
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), driver.start("+15550001")).await;
        assert!(abandoned.is_err(), "start should still be waiting for the prompt");

        wait_for_stage(&driver, "+15550001", Stage::AwaitingCode).await;
        match driver.submit_code("+15550001", "12345", None).await {
            Err(ProvisionError::ProcessFailed { reason, .. }) => {
                assert!(reason.contains("got 12345"), "reason: {}", reason);
            }
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
        assert!(driver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_submit_still_advances_to_second_factor() {
        let dir = TempDir::new().unwrap();
        let driver = driver_for(
            "printf 'Enter the verification code: '; read code; sleep 0.5; \
             echo 'Two-factor authentication is enabled'; read pw; \
             echo \"[ERROR] password was $pw\"; echo '[FAILED]'",
            &dir,
            Duration::from_secs(10),
        );
        assert_eq!(
            driver.start("+15550001").await.unwrap(),
            StartOutcome::WaitingForCode
        );
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            driver.submit_code("+15550001", "12345", None),
        )
        .await;
        assert!(abandoned.is_err(), "submit should still be waiting for output");

        wait_for_stage(&driver, "+15550001", Stage::AwaitingPassword).await;

        // A retried code must not be written into the password prompt.
        match driver.submit_code("+15550001", "12345", None).await {
            Err(ProvisionError::StageMismatch { actual, .. }) => {
                assert_eq!(actual, Stage::AwaitingPassword);
            }
            other => panic!("Expected StageMismatch, got {:?}", other),
        }

        match driver.submit_second_factor("+15550001", "hunter2").await {
            Err(ProvisionError::ProcessFailed { reason, .. }) => {
                assert!(reason.contains("password was hunter2"), "reason: {}", reason);
            }
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_to_exiting_process_reports_its_output() {
        let dir = TempDir::new().unwrap();
        // Prompts, stops reading, complains on stderr and exits a bit later.
        let driver = driver_for(
            "printf 'Enter the verification code: '; exec 0<&-; echo 'account locked' >&2; sleep 0.3; exit 1",
            &dir,
            Duration::from_secs(10),
        );
        driver.start("+15550001").await.unwrap();

        match driver.submit_code("+15550001", "12345", None).await {
            Err(ProvisionError::ProcessFailed { status, reason }) => {
                assert_eq!(status, Some(1));
                assert!(reason.contains("account locked"), "reason: {}", reason);
            }
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
        assert!(driver.registry().is_empty());
    }
}
