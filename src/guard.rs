//! Per-conversation deadline.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`TimeoutGuard`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTrigger {
    /// The conversation's absolute deadline passed.
    Deadline,
    /// The process exited while nobody was driving the conversation.
    ProcessExited,
}

/// Background timer that runs a teardown action once, at the deadline or
/// when the process exits, unless disarmed first.
///
/// The action may still run after a racing [`disarm`](Self::disarm), so it
/// has to re-check the conversation state under its lock.
#[derive(Debug)]
pub struct TimeoutGuard {
    cancel: CancellationToken,
}

impl TimeoutGuard {
    pub fn arm<F, Fut>(deadline: Instant, process_exit: CancellationToken, on_fire: F) -> Self
    where
        F: FnOnce(GuardTrigger) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let disarmed = cancel.clone();
        tokio::spawn(async move {
            let trigger = tokio::select! {
                biased;
                _ = disarmed.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => GuardTrigger::Deadline,
                _ = process_exit.cancelled() => GuardTrigger::ProcessExited,
            };
            on_fire(trigger).await;
        });
        Self { cancel }
    }

    pub fn disarm(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
