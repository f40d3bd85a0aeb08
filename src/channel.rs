//! Conversational wrapper around one spawned login process.
//!
//! The process is treated as a message-passing partner: stdout and stderr are
//! read as raw byte chunks by background tasks and delivered as decoded
//! [`ChannelEvent`]s, stdin is an outbound line channel. Prompts such as
//! `Enter the verification code: ` are not newline-terminated, so output is
//! never split on lines.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ChannelError;

/// How long to wait for the output readers to hit EOF once the process is gone.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 4096;

/// Everything needed to launch the login program, minus the phone number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Inbound event from the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(String),
    Stderr(String),
    /// Always delivered last. `-1` when the process was killed by a signal.
    Exited(i32),
}

/// Owns one spawned process and its pipes.
pub struct ProcessChannel {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessChannel {
    /// Spawn `program args... <key>`.
    ///
    /// Must be called from within a Tokio runtime: the pipe readers and the
    /// exit supervisor run as background tasks.
    pub fn spawn(spec: &LaunchSpec, key: &str) -> Result<Self, ChannelError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .arg(key)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ChannelError::SpawnFailed {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let (tx, events) = mpsc::unbounded_channel();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, tx.clone(), ChannelEvent::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, tx.clone(), ChannelEvent::Stderr)));
        }

        let kill = CancellationToken::new();
        let exited = CancellationToken::new();
        tokio::spawn(supervise(child, readers, tx, kill.clone(), exited.clone()));

        Ok(Self {
            pid,
            stdin,
            events,
            kill,
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Token that is cancelled once the process has exited and its output
    /// streams have drained.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Write `text` followed by a newline to the process input.
    pub async fn write_line(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.exited.is_cancelled() {
            self.stdin = None;
            return Err(ChannelError::Closed);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::Closed);
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(pid = ?self.pid, error = %e, "Process input closed");
            self.stdin = None;
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Wait for the next event. `None` once every sender is gone, which only
    /// happens after [`ChannelEvent::Exited`] has been consumed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close stdin and request termination. Idempotent.
    pub fn terminate(&mut self) {
        self.stdin = None;
        self.kill.cancel();
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Forward decoded chunks from one output stream until EOF.
async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    wrap: fn(String) -> ChannelEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() && tx.send(wrap(text)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(wrap(rest));
    }
}

/// Wait for the process (or a kill request), then report the exit after the
/// readers have drained so that `Exited` is ordered after all output.
async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    kill: CancellationToken,
    exited: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill request failed, process already gone");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "Failed to wait for login process");
            -1
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!("Output stream still open after exit, abandoning reader");
            reader.abort();
        }
    }

    exited.cancel();
    let _ = tx.send(ChannelEvent::Exited(code));
}

/// Incremental UTF-8 decoder that holds back an incomplete trailing sequence
/// until the next chunk arrives. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left at EOF.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
