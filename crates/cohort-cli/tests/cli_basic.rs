//! Basic CLI E2E tests.
//!
//! Tests invoke the built binary directly and only exercise commands that
//! never touch the study platform. Each test gets its own config dir via
//! `COHORT_CONFIG_DIR`.

use std::path::Path;
use std::process::Command;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(args: &[&str], config_dir: &Path) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_cohort"))
        .args(args)
        .env("COHORT_CONFIG_DIR", config_dir)
        .output()
        .expect("failed to execute CLI");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _, code) = run_cli(&["--help"], dir.path());
    assert_eq!(code, 0);
    for sub in ["cycle", "participant", "pool", "catalog", "config"] {
        assert!(stdout.contains(sub), "missing subcommand {sub}");
    }
}

#[test]
fn catalog_check_passes() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _, code) = run_cli(&["catalog", "check"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("catalog ok"));
}

#[test]
fn catalog_show_lists_modules_and_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _, code) = run_cli(&["catalog", "show"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("orientation"));
    assert!(stdout.contains("core_check_ins"));
    assert!(stdout.contains("$15"));
    assert!(stdout.contains("$20"));
}

#[test]
fn completions_emit_script() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _, code) = run_cli(&["completions", "bash"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("cohort"));
}

#[test]
fn config_init_show_and_path() {
    let dir = tempfile::tempdir().unwrap();

    let (stdout, _, code) = run_cli(&["config", "path"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("config.toml"));

    let (stdout, _, code) = run_cli(&["config", "init"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("config.toml"));

    let (stdout, _, code) = run_cli(&["config", "show"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("[api]"));
    assert!(stdout.contains("[study]"));

    let (_, stderr, code) = run_cli(&["config", "init"], dir.path());
    assert_eq!(code, 1);
    assert!(stderr.contains("--force"));

    let (_, _, code) = run_cli(&["config", "init", "--force"], dir.path());
    assert_eq!(code, 0);
}

#[test]
fn config_show_masks_the_access_key() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        r#"
        [api]
        base_url = "https://api.example.org"
        access_key = "super-secret"
        study_id = "study-1"
        "#,
    )
    .unwrap();

    let (stdout, _, code) = run_cli(&["config", "show"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("********"));
    assert!(!stdout.contains("super-secret"));
}

#[test]
fn remote_commands_require_a_configured_api() {
    let dir = tempfile::tempdir().unwrap();

    // No config file at all.
    let (_, stderr, code) = run_cli(&["pool", "status"], dir.path());
    assert_eq!(code, 1);
    assert!(stderr.contains("error:"));

    // Default config has a blank endpoint.
    let (_, _, code) = run_cli(&["config", "init"], dir.path());
    assert_eq!(code, 0);
    let (_, stderr, code) = run_cli(&["cycle", "run"], dir.path());
    assert_eq!(code, 1);
    assert!(stderr.contains("api.base_url"));
}
