#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{Project, is_process_alive, read_pid, wait_for_path, wait_until};
use predicates::prelude::*;

const CONFIG: &str = r#"version: "1"
services:
  web:
    command: "echo web ready; sleep 30"
    depends_on: [db]
  db:
    command: "echo db ready; sleep 30"
"#;

#[cfg(target_os = "linux")]
#[test]
fn up_top_down_round_trip() {
    let project = Project::new(CONFIG);
    let socket = project.dir.join("ctl.sock");
    let tandem = || {
        let mut cmd = project.tandem();
        cmd.arg("--unix-socket").arg(&socket);
        cmd
    };

    // No credential file: sync is skipped, supervision still comes up.
    tandem().arg("up").assert().success();
    let pid_path = project.supervisor_pid_path();
    assert!(wait_for_path(&pid_path), "supervisor PID file missing");
    let supervisor = read_pid(&pid_path).expect("supervisor pid");
    assert!(is_process_alive(supervisor));

    assert!(wait_until(Duration::from_secs(5), || {
        tandem()
            .arg("top")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).matches("RUNNING").count() == 2)
            .unwrap_or(false)
    }));

    // A second `up` only starts what is not running yet.
    tandem().arg("up").assert().success();

    tandem().args(["stop", "web"]).assert().success();
    tandem()
        .args(["ps", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("STOPPED"));

    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(project.program_log("db"))
            .map(|log| log.contains("db ready"))
            .unwrap_or(false)
    }));
    tandem()
        .args(["logs", "--tail", "1", "db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("db ready"));

    tandem().arg("down").assert().success();
    assert!(wait_until(Duration::from_secs(10), || !pid_path.exists()));

    tandem()
        .arg("top")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must first be started"));
}

// The program shrugs off SIGTERM, so stopping it takes its whole stopwaitsecs.
const SLOW_STOP_CONFIG: &str = r#"services:
  worker:
    command: "trap '' TERM; echo v1; while true; do sleep 0.1; done"
    supervisor:
      stopwaitsecs: "10"
"#;

#[cfg(target_os = "linux")]
#[test]
fn reload_waits_for_a_slow_stop_and_relaunches() {
    let project = Project::new(SLOW_STOP_CONFIG);
    let socket = project.dir.join("ctl.sock");
    let tandem = || {
        let mut cmd = project.tandem();
        cmd.arg("--unix-socket").arg(&socket);
        cmd
    };

    tandem().arg("up").assert().success();
    let pid_path = project.supervisor_pid_path();
    assert!(wait_for_path(&pid_path), "supervisor PID file missing");
    let old = read_pid(&pid_path).expect("supervisor pid");
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(project.program_log("worker"))
            .map(|log| log.contains("v1"))
            .unwrap_or(false)
    }));

    fs::write(
        project.dir.join("tandem.yml"),
        "services:\n  worker:\n    command: \"echo v2; sleep 30\"\n",
    )
    .unwrap();
    tandem().arg("reload").assert().success();

    let new = read_pid(&pid_path).expect("supervisor pid after reload");
    assert_ne!(old, new);
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(project.program_log("worker"))
            .map(|log| log.contains("v2"))
            .unwrap_or(false)
    }));
    tandem()
        .arg("top")
        .assert()
        .success()
        .stdout(predicate::str::contains("RUNNING"));

    tandem().arg("down").assert().success();
    assert!(wait_until(Duration::from_secs(10), || !pid_path.exists()));
}

#[cfg(target_os = "linux")]
#[test]
fn stale_pid_file_does_not_count_as_running() {
    let project = Project::new(CONFIG);
    fs::create_dir_all(project.state_dir()).unwrap();
    fs::write(project.supervisor_pid_path(), "999999").unwrap();

    project
        .tandem()
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must first be started"));
    assert!(!project.supervisor_pid_path().exists());
}

#[test]
fn down_without_up_is_quiet() {
    let project = Project::new(CONFIG);
    project.tandem().arg("down").assert().success();
}
