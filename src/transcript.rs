//! Accumulated process output and prompt-marker detection.

use serde::{Deserialize, Serialize};

/// Maximum characters of output kept in a failure reason.
const FAILURE_REASON_TAIL: usize = 2000;

/// Number of trailing stdout lines used as a failure reason when stderr is empty.
const FAILURE_REASON_LINES: usize = 5;

/// A protocol-relevant event recognized in the login program's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Failure,
    Success,
    TwoFactor,
    CodeRequest,
}

impl Marker {
    /// Scan order. An error must never be masked by a stale success line.
    pub const PRIORITY: [Marker; 4] = [
        Marker::Failure,
        Marker::Success,
        Marker::TwoFactor,
        Marker::CodeRequest,
    ];
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Marker::Failure => write!(f, "failure"),
            Marker::Success => write!(f, "success"),
            Marker::TwoFactor => write!(f, "two_factor"),
            Marker::CodeRequest => write!(f, "code_request"),
        }
    }
}

/// Marker texts, configurable under `[markers]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSet {
    #[serde(default = "default_code_request")]
    pub code_request: String,
    #[serde(default = "default_two_factor")]
    pub two_factor: String,
    #[serde(default = "default_success")]
    pub success: String,
    #[serde(default = "default_failure")]
    pub failure: String,
}

fn default_code_request() -> String {
    "Enter the verification code".to_string()
}

fn default_two_factor() -> String {
    "Two-factor authentication is enabled".to_string()
}

fn default_success() -> String {
    "[SUCCESS] Session file created".to_string()
}

fn default_failure() -> String {
    "[FAILED]".to_string()
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            code_request: default_code_request(),
            two_factor: default_two_factor(),
            success: default_success(),
            failure: default_failure(),
        }
    }
}

impl MarkerSet {
    pub fn text(&self, marker: Marker) -> &str {
        match marker {
            Marker::Failure => &self.failure,
            Marker::Success => &self.success,
            Marker::TwoFactor => &self.two_factor,
            Marker::CodeRequest => &self.code_request,
        }
    }

    fn longest(&self) -> usize {
        Marker::PRIORITY
            .iter()
            .map(|m| self.text(*m).len())
            .max()
            .unwrap_or(0)
    }
}

/// Append-only record of everything a login process printed.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    stdout: String,
    stderr: String,
    /// Byte offset into `stdout` up to which markers have been reported.
    scanned: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stdout(&mut self, chunk: &str) {
        self.stdout.push_str(chunk);
    }

    pub fn push_stderr(&mut self, chunk: &str) {
        self.stderr.push_str(chunk);
    }

    /// Look for a marker in stdout received since the last scan.
    ///
    /// The window reaches back far enough to catch a marker split across
    /// chunks, but a match has to end inside the new data so nothing is
    /// reported twice. Markers not listed in `expected` are skipped.
    pub fn scan(&mut self, markers: &MarkerSet, expected: &[Marker]) -> Option<Marker> {
        let new_start = self.scanned;
        let mut window_start = new_start.saturating_sub(markers.longest().saturating_sub(1));
        while !self.stdout.is_char_boundary(window_start) {
            window_start -= 1;
        }
        self.scanned = self.stdout.len();

        let window = &self.stdout[window_start..];
        Marker::PRIORITY
            .iter()
            .copied()
            .filter(|marker| expected.contains(marker))
            .find(|marker| {
                let text = markers.text(*marker);
                !text.is_empty()
                    && window
                        .match_indices(text)
                        .any(|(offset, _)| window_start + offset + text.len() > new_start)
            })
    }

    /// Human-readable reason for a failed conversation: stderr when the
    /// process wrote any, otherwise the last few stdout lines.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return tail(stderr, FAILURE_REASON_TAIL).to_string();
        }

        let lines: Vec<&str> = self
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            return "Unknown error".to_string();
        }
        let start = lines.len().saturating_sub(FAILURE_REASON_LINES);
        tail(&lines[start..].join("\n"), FAILURE_REASON_TAIL).to_string()
    }
}

/// Last `max` bytes of `text`, moved forward to a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
