//! Integration tests for the codeloop CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Get a Command for the codeloop binary, isolated from user config
fn codeloop(home: &Path) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("codeloop"));
    cmd.env("XDG_CONFIG_HOME", home.join("xdg"))
        .env("HOME", home)
        .env_remove("CODELOOP_CONFIG")
        .env_remove("CODELOOP_MAX_CONCURRENT")
        .env_remove("CODELOOP_ADMISSION")
        .env_remove("CODELOOP_ISOLATION")
        .env_remove("RUST_LOG");
    cmd
}

fn has(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Generator that ignores the prompt and answers with a fixed bash program.
const FAKE_GENERATOR_CONFIG: &str = r#"
[generator]
backend = "cli"
command = "sh"
args = ["-c", "cat > /dev/null; printf '```bash\\necho PASS: greets\\n```\\n'"]
max_retries = 1

[sandbox]
isolation = "process"
execution_timeout_secs = 10
"#;

#[test]
fn test_help() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("quality bar"));
}

#[test]
fn test_version() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_run_rejects_unsupported_language() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--task", "sort a list", "--language", "cobol"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cobol"));
}

#[test]
fn test_run_rejects_out_of_range_threshold() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args([
            "run",
            "--task",
            "greet",
            "--language",
            "python",
            "--threshold",
            "150",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("quality_threshold"));
}

#[test]
fn test_run_end_to_end_with_fake_generator() {
    if !has("sh") || !has("bash") {
        eprintln!("skipping: sh/bash not available");
        return;
    }
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("codeloop.toml");
    std::fs::write(&config, FAKE_GENERATOR_CONFIG).unwrap();

    let output = codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .arg("--config")
        .arg(&config)
        .args([
            "run",
            "--task",
            "print a greeting",
            "--language",
            "bash",
            "--criterion",
            "greets",
            "--max-iterations",
            "2",
            "--json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let outcome: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["reason"], "quality_threshold_met");
    assert_eq!(outcome["total_iterations"], 1);
    assert!(outcome["final_code"]
        .as_str()
        .unwrap()
        .contains("echo PASS: greets"));
}

#[test]
fn test_run_reports_generation_failure() {
    if !has("sh") {
        eprintln!("skipping: sh not available");
        return;
    }
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("codeloop.toml");
    std::fs::write(
        &config,
        r#"
[generator]
command = "sh"
args = ["-c", "exit 9"]
max_retries = 1

[sandbox]
isolation = "process"
"#,
    )
    .unwrap();

    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "--task", "greet", "--language", "bash"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("generation_failed"));
}

#[test]
fn test_quick_test_runs_file() {
    if !has("bash") {
        eprintln!("skipping: bash not available");
        return;
    }
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("check.sh");
    std::fs::write(&script, "echo 'PASS: all tests pass'\n").unwrap();

    let output = codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["--isolation", "process", "quick-test"])
        .arg(&script)
        .args(["--language", "bash", "--test-type", "unit", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let result: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(result["execution"]["exit_code"], 0);
    assert_eq!(result["execution"]["timed_out"], false);
    assert_eq!(result["execution"]["backend_kind"], "process-fallback");
    assert_eq!(result["report"]["score"], 100);
}

#[test]
fn test_quick_test_reports_failing_program() {
    if !has("bash") {
        eprintln!("skipping: bash not available");
        return;
    }
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("broken.sh");
    std::fs::write(&script, "echo oops >&2\nexit 3\n").unwrap();

    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["--isolation", "process", "quick-test"])
        .arg(&script)
        .args(["--language", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Exit code: 3"))
        .stdout(predicate::str::contains("oops"));
}

#[test]
fn test_quick_test_missing_file() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["--isolation", "process", "quick-test", "nope.py", "--language", "python"])
        .assert()
        .failure();
}

#[test]
fn test_probe_process_isolation() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["--isolation", "process", "probe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("process-fallback"))
        .stdout(predicate::str::contains("python"));
}

#[test]
fn test_config_show_defaults() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Defaults"))
        .stdout(predicate::str::contains("[session]"))
        .stdout(predicate::str::contains("default_max_iterations = 5"));
}

#[test]
fn test_config_show_applies_overrides() {
    let temp = TempDir::new().unwrap();
    let output = codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .env("CODELOOP_MAX_CONCURRENT", "9")
        .args(["--admission", "reject", "config", "show", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let config: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(config["concurrency"]["max_concurrent_sessions"], 9);
    assert_eq!(config["concurrency"]["admission"], "reject");
}

#[test]
fn test_config_discovered_from_project() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join(".codeloop");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.toml"),
        "[session]\ndefault_max_iterations = 7\n",
    )
    .unwrap();

    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default_max_iterations = 7"));
}

#[test]
fn test_config_validate_rejects_bad_values() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("bad.toml");
    std::fs::write(&config, "[session]\ndefault_quality_threshold = 101\n").unwrap();

    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("default_quality_threshold"));
}

#[test]
fn test_config_validate_rejects_malformed_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("broken.toml");
    std::fs::write(&config, "[session\n").unwrap();

    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .code(7);
}

#[test]
fn test_config_validate_defaults() {
    let temp = TempDir::new().unwrap();
    codeloop(temp.path())
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("defaults are valid"));
}
