//! CLI integration tests for vault-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for configuration errors. Nothing here needs a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the vault-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("vault-migrate").unwrap()
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("replay-deletions"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--recursive"))
        .stdout(predicate::str::contains("-r"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("[NODE]..."));
}

#[test]
fn test_replay_subcommand_help() {
    cmd()
        .args(["replay-deletions", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--recursive").not());
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vault-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_workers_must_be_a_number() {
    cmd()
        .args(["run", "--workers", "many"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 2)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nonexistent_config_file.yaml"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let file = config_file("invalid: yaml: content: [\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_empty_config_exits_with_code_2() {
    let file = config_file("");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_root_id_exits_with_code_2() {
    let file = config_file(
        "source:\n  host: db\n  database: vospace\n  user: sa\n  password: x\n\
         target:\n  host: pg\n  database: vospace\n  user: pg\n  password: x\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "replay-deletions"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("root_id"));
}

#[test]
fn test_invalid_setting_exits_with_code_2() {
    let file = config_file(
        "source:\n  host: db\n  database: vospace\n  user: sa\n  password: x\n\
         target:\n  host: pg\n  database: vospace\n  user: pg\n  password: x\n  \
         root_id: 00000000-0000-0000-0000-000000000001\n\
         migration:\n  page_size: 1\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("page_size"));
}

#[test]
fn test_unknown_log_format_exits_with_code_2() {
    cmd()
        .args(["--log-format", "xml", "health-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("xml"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
