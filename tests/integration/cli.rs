#[path = "common/mod.rs"]
mod common;

use common::Project;
use predicates::prelude::*;

const CONFIG: &str = r#"version: "1"
services:
  web:
    command: "sleep 30"
    depends_on: [db]
  db:
    command: "sleep 30"
  cache:
    command: "sleep 30"
    supervisor:
      autostart: "false"
"#;

#[test]
fn config_prints_the_merged_manifest() {
    let project = Project::new(CONFIG);
    let output = project.tandem().arg("config").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();

    let db = stdout.find("[program:db]").expect("db section");
    let web = stdout.find("[program:web]").expect("web section");
    assert!(db < web, "dependencies come first:\n{stdout}");
    assert!(stdout.contains("[supervisorctl]"));
    assert!(stdout.contains("username = "));
    assert!(stdout.contains("serverurl = http://127.0.0.1:9"));
    assert!(!stdout.contains("__defaults__"));
    assert!(!stdout.contains("__overrides__"));
}

#[test]
fn config_services_lists_start_order() {
    let project = Project::new(CONFIG);
    project
        .tandem()
        .args(["config", "--services"])
        .assert()
        .success()
        .stdout("db\nweb\ncache\n");
}

#[test]
fn excluded_programs_leave_the_manifest() {
    let project = Project::new(CONFIG);
    project
        .tandem()
        .args(["config", "--exclude", "cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[program:cache]").not())
        .stdout(predicate::str::contains("[program:web]"));
}

#[test]
fn unix_socket_switches_the_endpoint() {
    let project = Project::new(CONFIG);
    let socket = project.dir.join("ctl.sock");
    project
        .tandem()
        .arg("config")
        .arg("--unix-socket")
        .arg(&socket)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "serverurl = unix://{}",
            socket.display()
        )));
}

#[test]
fn operations_before_up_fail() {
    let project = Project::new(CONFIG);
    for args in [
        vec!["start"],
        vec!["stop", "web"],
        vec!["kill", "-s", "TERM"],
        vec!["top"],
        vec!["logs", "db"],
    ] {
        project
            .tandem()
            .args(&args)
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "Services must first be started with 'up'",
            ));
    }
}

#[test]
fn unknown_service_is_rejected() {
    let project = Project::new(CONFIG);
    project
        .tandem()
        .args(["up", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such service: ghost"));
}

#[test]
fn dependency_cycles_are_reported() {
    let project = Project::new(
        "services:\n  a:\n    command: run\n    depends_on: [b]\n  b:\n    command: run\n    links: [a]\n",
    );
    project
        .tandem()
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Circular dependency between"));
}

#[test]
fn missing_config_file_fails() {
    let project = Project::new(CONFIG);
    project
        .tandem()
        .args(["-f", "absent.yml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}
