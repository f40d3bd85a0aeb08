//! Integration tests for the provisiond CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a provisiond Command with a clean environment
fn provisiond() -> Command {
    let mut cmd = cargo_bin_cmd!("provisiond");
    cmd.env_remove("PROVISIOND_SCRIPT")
        .env_remove("PROVISIOND_PORT")
        .env_remove("PROVISIOND_ARTIFACT_DIR")
        .env_remove("PROVISIOND_TIMEOUT_SECS");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        provisiond()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        provisiond().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        provisiond().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_serve_rejects_invalid_port() {
        provisiond()
            .args(["serve", "--port", "not-a-port"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file"))
            .stdout(predicate::str::contains("port = 3000"))
            .stdout(predicate::str::contains("timeout_secs = 30"))
            .stdout(predicate::str::contains("[SUCCESS] Session file created"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = TempDir::new().unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created provisiond.toml"));

        let content = fs::read_to_string(dir.path().join("provisiond.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("[artifacts]"));
        assert!(content.contains("PYTHONUNBUFFERED"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("provisiond.toml"), "[server]\nport = 9999\n").unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("provisiond.toml")).unwrap();
        assert!(content.contains("9999"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("provisiond.toml"),
            "[conversation]\ntimeout_secs = 0\n",
        )
        .unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("timeout_secs"));
    }

    #[test]
    fn test_config_validate_clean_config() {
        let dir = TempDir::new().unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_flag_points_elsewhere() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[server]\nport = 4242\n").unwrap();

        provisiond()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4242"));
    }

    #[test]
    fn test_env_override_shows_in_effective_values() {
        let dir = TempDir::new().unwrap();

        provisiond()
            .current_dir(dir.path())
            .env("PROVISIOND_PORT", "5151")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("listen = 127.0.0.1:5151"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("provisiond.toml"), "[server\n").unwrap();

        provisiond()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse provisiond.toml"));
    }
}
