//! Configuration for provisiond, read from `provisiond.toml`.
//!
//! Every section is optional. Settings are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//!
//! [script]
//! program = "python"
//! args = ["scripts/session_gen.py"]
//! working_dir = "."
//!
//! [script.env]
//! PYTHONUNBUFFERED = "1"
//!
//! [conversation]
//! timeout_secs = 30
//!
//! [artifacts]
//! dir = "sessions"
//! extension = "session"
//! grace_period_ms = 1000
//! max_attempts = 5
//! initial_backoff_ms = 100
//! max_backoff_ms = 2000
//!
//! [markers]
//! code_request = "Enter the verification code"
//! two_factor = "Two-factor authentication is enabled"
//! success = "[SUCCESS] Session file created"
//! failure = "[FAILED]"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::{ArtifactHandoff, RetryPolicy};
use crate::channel::LaunchSpec;
use crate::transcript::{Marker, MarkerSet};

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "provisiond.toml";

pub const ENV_SCRIPT: &str = "PROVISIOND_SCRIPT";
pub const ENV_PORT: &str = "PROVISIOND_PORT";
pub const ENV_ARTIFACT_DIR: &str = "PROVISIOND_ARTIFACT_DIR";
pub const ENV_TIMEOUT_SECS: &str = "PROVISIOND_TIMEOUT_SECS";

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// How to launch the login program. The phone number is appended as the
/// last argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Relative to the directory containing the config file.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Extra environment for the process
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

fn default_program() -> String {
    "python".to_string()
}

fn default_args() -> Vec<String> {
    vec!["scripts/session_gen.py".to_string()]
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())])
}

impl Default for ScriptSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            working_dir: default_working_dir(),
            env: default_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSection {
    /// Lifetime of one conversation, measured from start
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Where session files appear and how patiently they are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsSection {
    /// Relative to the script's working directory.
    #[serde(default = "default_artifact_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_extension() -> String {
    "session".to_string()
}

fn default_grace_period_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: default_artifact_dir(),
            extension: default_extension(),
            grace_period_ms: default_grace_period_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// The complete provisiond.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub script: ScriptSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub markers: MarkerSet,
}

impl ProvisionToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse provisiond.toml")
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize provisiond.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.script.program.trim().is_empty() {
            warnings.push("script.program is empty: no login program to run".to_string());
        }
        if self.conversation.timeout_secs == 0 {
            warnings.push(
                "conversation.timeout_secs is 0: every conversation will time out immediately"
                    .to_string(),
            );
        }
        if self.artifacts.max_attempts == 0 {
            warnings.push(
                "artifacts.max_attempts is 0: the session file will still be read once"
                    .to_string(),
            );
        }
        if self.artifacts.initial_backoff_ms > self.artifacts.max_backoff_ms {
            warnings.push(format!(
                "artifacts.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.artifacts.initial_backoff_ms, self.artifacts.max_backoff_ms
            ));
        }
        if self.artifacts.extension.is_empty() {
            warnings.push("artifacts.extension is empty".to_string());
        }
        for marker in Marker::PRIORITY {
            if self.markers.text(marker).is_empty() {
                warnings.push(format!(
                    "markers.{} is empty: it will never be detected",
                    marker
                ));
            }
        }

        warnings
    }
}

/// Resolved runtime configuration.
///
/// It merges settings from:
/// 1. provisiond.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Directory relative paths in the file resolve against
    pub base_dir: PathBuf,
    /// Path the file was (or would be) loaded from
    pub config_path: PathBuf,
    /// Parsed provisiond.toml with overrides applied
    pub toml: ProvisionToml,
}

impl ProvisionConfig {
    /// Load from `config_path`, falling back to defaults if it is missing.
    pub fn load(config_path: &Path) -> Result<Self> {
        let toml = ProvisionToml::load_or_default(config_path)?;
        let base_dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            base_dir,
            config_path: config_path.to_path_buf(),
            toml,
        })
    }

    /// Load, apply environment overrides, then CLI overrides.
    pub fn with_cli_args(
        config_path: &Path,
        port: Option<u16>,
        host: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;
        config.apply_env()?;
        if let Some(port) = port {
            config.toml.server.port = port;
        }
        if let Some(host) = host {
            config.toml.server.host = host;
        }
        Ok(config)
    }

    /// Apply `PROVISIOND_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = lookup(ENV_SCRIPT) {
            self.toml.script.program = program;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.toml.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_PORT, port))?;
        }
        if let Some(dir) = lookup(ENV_ARTIFACT_DIR) {
            self.toml.artifacts.dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.toml.conversation.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_TIMEOUT_SECS, secs))?;
        }
        Ok(())
    }

    /// Working directory of the login program.
    pub fn working_dir(&self) -> PathBuf {
        resolve(&self.base_dir, &self.toml.script.working_dir)
    }

    /// Directory the login program writes session files into. Relative
    /// paths follow the program's working directory.
    pub fn artifact_dir(&self) -> PathBuf {
        resolve(&self.working_dir(), &self.toml.artifacts.dir)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.toml.script.program.clone(),
            args: self.toml.script.args.clone(),
            working_dir: self.working_dir(),
            env: self.toml.script.env.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.toml.conversation.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.toml.artifacts.grace_period_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.toml.artifacts.max_attempts,
            initial_backoff: Duration::from_millis(self.toml.artifacts.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.toml.artifacts.max_backoff_ms),
        }
    }

    pub fn handoff(&self) -> ArtifactHandoff {
        ArtifactHandoff::new(
            self.artifact_dir(),
            self.toml.artifacts.extension.clone(),
            self.grace_period(),
            self.retry_policy(),
        )
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.toml.server.host, self.toml.server.port)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        let working_dir = self.working_dir();
        if !working_dir.is_dir() {
            warnings.push(format!(
                "script.working_dir does not exist: {}",
                working_dir.display()
            ));
        }
        warnings
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ProvisionToml::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.script.program, "python");
        assert_eq!(config.script.args, vec!["scripts/session_gen.py"]);
        assert_eq!(
            config.script.env.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );
        assert_eq!(config.conversation.timeout_secs, 30);
        assert_eq!(config.artifacts.dir, PathBuf::from("sessions"));
        assert_eq!(config.artifacts.grace_period_ms, 1000);
        assert_eq!(config.markers, MarkerSet::default());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_empty_is_default() {
        let config = ProvisionToml::parse("").unwrap();
        assert_eq!(config, ProvisionToml::default());
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = ProvisionToml::parse(
            r#"
[server]
port = 8080

[script]
program = "/usr/bin/python3"

[markers]
failure = "FATAL"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.script.program, "/usr/bin/python3");
        assert_eq!(config.script.args, vec!["scripts/session_gen.py"]);
        assert_eq!(config.markers.failure, "FATAL");
        assert_eq!(config.markers.success, "[SUCCESS] Session file created");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ProvisionToml::parse("[server\nport = ");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provisiond.toml");
        let mut config = ProvisionToml::default();
        config.conversation.timeout_secs = 45;
        config.save(&path).unwrap();

        let loaded = ProvisionToml::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ProvisionToml::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, ProvisionToml::default());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = ProvisionToml::default();
        config.conversation.timeout_secs = 0;
        config.markers.two_factor = String::new();
        config.artifacts.initial_backoff_ms = 5000;

        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("markers.two_factor")));
        assert!(warnings.iter().any(|w| w.contains("initial_backoff_ms")));
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provisiond.toml");
        std::fs::write(
            &path,
            r#"
[script]
working_dir = "bot"

[artifacts]
dir = "out"
"#,
        )
        .unwrap();

        let config = ProvisionConfig::load(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.working_dir(), dir.path().join("bot"));
        assert_eq!(config.artifact_dir(), dir.path().join("bot").join("out"));
        assert_eq!(config.launch_spec().working_dir, dir.path().join("bot"));
    }

    #[test]
    fn test_absolute_artifact_dir_is_kept() {
        let dir = tempdir().unwrap();
        let mut config = ProvisionConfig::load(&dir.path().join("provisiond.toml")).unwrap();
        config.toml.artifacts.dir = dir.path().join("abs");
        assert_eq!(config.artifact_dir(), dir.path().join("abs"));
    }

    #[test]
    fn test_bare_file_name_uses_current_dir() {
        let config = ProvisionConfig::load(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("."));
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempdir().unwrap();
        let mut config = ProvisionConfig::load(&dir.path().join("provisiond.toml")).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SCRIPT, "python3"),
            (ENV_PORT, "4000"),
            (ENV_ARTIFACT_DIR, "/tmp/sessions"),
            (ENV_TIMEOUT_SECS, "60"),
        ]);
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.toml.script.program, "python3");
        assert_eq!(config.toml.server.port, 4000);
        assert_eq!(config.artifact_dir(), PathBuf::from("/tmp/sessions"));
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.bind_addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let dir = tempdir().unwrap();
        let mut config = ProvisionConfig::load(&dir.path().join("provisiond.toml")).unwrap();
        let result = config.apply_overrides(|name| {
            (name == ENV_PORT).then(|| "not-a-port".to_string())
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn test_retry_policy_and_handoff_from_config() {
        let dir = tempdir().unwrap();
        let config = ProvisionConfig::load(&dir.path().join("provisiond.toml")).unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.grace_period(), Duration::from_secs(1));
        assert_eq!(
            config.handoff().path_for("+15550001"),
            dir.path().join("sessions").join("+15550001.session")
        );
    }
}
