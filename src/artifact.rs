//! Pickup of the session file a successful login leaves behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use crate::errors::ProvisionError;

/// Bounded exponential backoff for artifact reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// A collected session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    pub size: usize,
    /// Standard padded base64 of the file contents.
    pub base64: String,
}

impl Artifact {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.base64)
    }
}

/// Reads, encodes and deletes `<dir>/<key>.<extension>`.
#[derive(Debug, Clone)]
pub struct ArtifactHandoff {
    dir: PathBuf,
    extension: String,
    grace_period: Duration,
    retry: RetryPolicy,
}

impl ArtifactHandoff {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        grace_period: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            grace_period,
            retry,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, self.extension))
    }

    /// Create the artifact directory. An existing directory is fine.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Wait out the grace period, read the file (retrying while it is absent
    /// or still empty), then delete it.
    pub async fn collect(&self, key: &str) -> Result<Artifact, ProvisionError> {
        let path = self.path_for(key);
        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }

        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let bytes = loop {
            match tokio::fs::read(&path).await {
                Ok(bytes) if !bytes.is_empty() => break bytes,
                Ok(_) => debug!(path = %path.display(), attempt, "Session file still empty"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), attempt, "Session file not there yet")
                }
                Err(source) => return Err(ProvisionError::ArtifactUnreadable { path, source }),
            }
            if attempt >= attempts {
                return Err(ProvisionError::ArtifactMissing { path });
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        };

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete session file after pickup");
        }

        Ok(Artifact {
            key: key.to_string(),
            size: bytes.len(),
            base64: STANDARD.encode(&bytes),
        })
    }

    /// Delete a leftover artifact for `key`, if any.
    pub async fn discard(&self, key: &str) {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Discarded leftover session file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard session file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_handoff(dir: &Path) -> ArtifactHandoff {
        ArtifactHandoff::new(
            dir,
            "session",
            Duration::ZERO,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
            },
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(6), Duration::from_millis(2000));
        assert_eq!(policy.delay(100), Duration::from_millis(2000));
    }

    #[test]
    fn test_path_for_key() {
        let handoff = fast_handoff(Path::new("sessions"));
        assert_eq!(
            handoff.path_for("+15550001"),
            PathBuf::from("sessions/+15550001.session")
        );
    }

    #[tokio::test]
    async fn test_collect_encodes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let handoff = fast_handoff(dir.path());
        let bytes: Vec<u8> = (0..128u8).collect();
        std::fs::write(handoff.path_for("+15550001"), &bytes).unwrap();

        let artifact = handoff.collect("+15550001").await.unwrap();
        assert_eq!(artifact.key, "+15550001");
        assert_eq!(artifact.size, 128);
        assert_eq!(artifact.decode().unwrap(), bytes);
        assert!(!handoff.path_for("+15550001").exists());
    }

    #[tokio::test]
    async fn test_second_collect_is_missing() {
        let dir = TempDir::new().unwrap();
        let handoff = fast_handoff(dir.path());
        std::fs::write(handoff.path_for("+15550001"), b"data").unwrap();

        handoff.collect("+15550001").await.unwrap();
        let err = handoff.collect("+15550001").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ArtifactMissing { .. }));
    }

    #[tokio::test]
    async fn test_collect_waits_for_late_file() {
        let dir = TempDir::new().unwrap();
        let handoff = ArtifactHandoff::new(
            dir.path(),
            "session",
            Duration::ZERO,
            RetryPolicy {
                max_attempts: 10,
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(50),
            },
        );
        let path = handoff.path_for("+15550001");
        std::fs::write(&path, b"").unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            std::fs::write(&path, b"late").unwrap();
        });

        let artifact = handoff.collect("+15550001").await.unwrap();
        writer.await.unwrap();
        assert_eq!(artifact.decode().unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_unreadable_path_is_reported() {
        let dir = TempDir::new().unwrap();
        let handoff = fast_handoff(dir.path());
        // A directory where the file should be cannot be read as a file.
        std::fs::create_dir(handoff.path_for("+15550001")).unwrap();

        let err = handoff.collect("+15550001").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ArtifactUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_discard_ignores_missing_file() {
        let dir = TempDir::new().unwrap();
        let handoff = fast_handoff(dir.path());
        handoff.discard("+15550001").await;

        std::fs::write(handoff.path_for("+15550001"), b"x").unwrap();
        handoff.discard("+15550001").await;
        assert!(!handoff.path_for("+15550001").exists());
    }

    #[test]
    fn test_ensure_dir_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let handoff = fast_handoff(&dir.path().join("nested/sessions"));
        handoff.ensure_dir().unwrap();
        handoff.ensure_dir().unwrap();
        assert!(handoff.dir().is_dir());
    }
}
