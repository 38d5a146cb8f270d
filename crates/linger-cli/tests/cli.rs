use assert_cmd::Command;
use std::path::Path;
use tempfile::TempDir;

/// A state directory whose config points at a port nothing listens on and
/// forbids starting a server.
fn offline_home() -> TempDir {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("config.toml"),
        "[client]\nurl = \"http://127.0.0.1:9\"\nauto_start = false\n",
    )
    .unwrap();
    home
}

fn linger(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("linger").unwrap();
    cmd.env("LINGER_HOME", home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let home = offline_home();
    let out = linger(home.path()).arg("--help").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for sub in ["create", "list", "attach", "kill", "rm"] {
        assert!(text.contains(sub), "missing {sub} in:\n{text}");
    }
}

#[test]
fn list_without_server_reads_the_registry() {
    let home = offline_home();
    std::fs::write(
        home.path().join("sessions.json"),
        r#"[
  {"id":"a1","name":"old","group":"default","pid":0,"command":["sleep","100"],
   "logFilePath":"/tmp/old.a1.log","createdAt":1,"lastActivity":1,"status":"running"},
  {"id":"b2","name":"done","group":"default","pid":0,"command":["true"],
   "logFilePath":"/tmp/done.b2.log","createdAt":2,"lastActivity":2,"status":"exited","exitCode":0},
  {"id":"c3","name":"elsewhere","group":"ci","pid":0,"command":["true"],
   "logFilePath":"/tmp/elsewhere.c3.log","createdAt":3,"lastActivity":3,"status":"exited"}
]"#,
    )
    .unwrap();

    let out = linger(home.path()).args(["list", "--json"]).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let entries: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "old");
    assert_eq!(entries[0]["alive"], false);
    assert_eq!(entries[1]["exitCode"], 0);

    let out = linger(home.path()).args(["list", "-g", "ci"]).output().unwrap();
    let table = String::from_utf8_lossy(&out.stdout);
    assert!(table.contains("elsewhere"));
    assert!(!table.contains("old"));
}

#[test]
fn empty_state_lists_nothing() {
    let home = offline_home();
    let out = linger(home.path()).arg("list").output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "no sessions\n");
}

#[test]
fn attach_needs_a_server_when_auto_start_is_off() {
    let home = offline_home();
    let out = linger(home.path()).args(["attach", "work"]).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("not reachable"));
}

#[test]
fn create_rejects_unknown_mode() {
    let home = offline_home();
    let out = linger(home.path())
        .args(["create", "work", "--mode", "tty", "--", "sh"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown mode"));
}

#[test]
fn malformed_config_is_reported() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("config.toml"), "[client\n").unwrap();
    let out = linger(home.path()).arg("list").output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("failed to parse config"));
}
