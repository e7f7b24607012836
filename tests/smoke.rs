//! Smoke tests -- verify the binary runs and the main subcommands work end to end.

use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

fn write_config(dir: &Path, executor: &str) -> String {
    let path = dir.join("runwarden.toml");
    let db = dir.join("smoke.db");
    std::fs::write(
        &path,
        format!(
            "[server]\ndb_path = \"{}\"\n\n[executor]\ncommand = \"{executor}\"\n\n[logging]\nlevel = \"warn\"\n",
            db.display()
        ),
    )
    .unwrap();
    path.display().to_string()
}

fn runwarden(config: &str) -> Command {
    let mut cmd = Command::cargo_bin("runwarden").unwrap();
    cmd.args(["--config", config]);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("runwarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Test scheduling"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("runwarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("runwarden"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["serve", "--help"][..],
        &["schedule", "list", "--help"],
        &["schedule", "run-now", "--help"],
        &["heal", "analyze", "--help"],
    ] {
        Command::cargo_bin("runwarden").unwrap().args(args).assert().success();
    }
}

#[test]
fn test_config_show_reflects_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true {test}");
    runwarden(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("smoke.db"))
        .stdout(contains("confidence_floor"));
}

#[test]
fn test_schedule_add_then_list() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true {test}");

    runwarden(&config)
        .args([
            "schedule",
            "add",
            "--suite",
            "nightly",
            "--at",
            "2099-06-01T02:00",
            "--timezone",
            "America/New_York",
        ])
        .assert()
        .success()
        .stdout(contains("added"))
        .stdout(contains("2099-06-01T06:00:00"));

    runwarden(&config)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(contains("nightly"))
        .stdout(contains("scheduled"));
}

#[test]
fn test_schedule_add_rejects_unknown_zone() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true {test}");
    runwarden(&config)
        .args(["schedule", "add", "--suite", "s", "--at", "2099-01-01T00:00", "--timezone", "Nowhere/City"])
        .assert()
        .failure()
        .stderr(contains("invalid timezone"));
}

#[cfg(unix)]
#[test]
fn test_run_now_waits_for_result() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true {test}");

    let output = runwarden(&config)
        .args(["schedule", "add", "--suite", "smoke", "--at", "2099-01-01T00:00"])
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    let id = stdout
        .split_whitespace()
        .nth(1)
        .expect("schedule id in output")
        .to_string();

    runwarden(&config)
        .args(["schedule", "run-now", &id])
        .assert()
        .success()
        .stdout(contains("attempt 0: passed (1/1 passed)"));

    runwarden(&config)
        .args(["schedule", "runs", &id])
        .assert()
        .success()
        .stdout(contains("passed"));
}

#[test]
fn test_heal_analyze_from_dom_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true {test}");
    let dom = dir.path().join("page.html");
    std::fs::write(
        &dom,
        r#"<html><body>
             <form id="login">
               <label for="email">Email address</label>
               <input id="email" type="email" name="email">
               <button type="submit" data-testid="sign-in">Sign in</button>
             </form>
           </body></html>"#,
    )
    .unwrap();

    runwarden(&config)
        .args([
            "heal",
            "analyze",
            "--selector",
            "button.btn-primary-x7",
            "--action",
            "click",
            "--dom-file",
        ])
        .arg(&dom)
        .assert()
        .success()
        .stdout(contains("Healing record"))
        .stdout(contains("sign-in"));
}
