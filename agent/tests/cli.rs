//! CLI tests: spawn the agent binary and check exit codes and output.

use std::fs;
use std::process::Command;

use agent::exit_codes;
use agent::test_support::{HEADER_SECTION, TestWorkspace};
use serde_json::{Value, json};

fn agent() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agent"));
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn apply_prints_report_and_edits_workspace() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws.path().join("plan.json");
    fs::write(
        &plan,
        json!({"ops": [{
            "type": "insert_before",
            "path": "sections/header.liquid",
            "anchor": "</header>",
            "content": "  <nav></nav>\n",
            "expected_anchor_count": 1
        }]})
        .to_string(),
    )
    .expect("plan");

    let output = agent()
        .current_dir(ws.path())
        .args(["apply", "--workdir"])
        .arg(ws.theme())
        .arg("--plan")
        .arg(&plan)
        .output()
        .expect("agent apply");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report: Value = serde_json::from_slice(&output.stdout).expect("report json");
    assert_eq!(report["changed_files"], json!(["sections/header.liquid"]));
    assert!(
        ws.read_theme_file("sections/header.liquid")
            .expect("header")
            .ends_with("  <nav></nav>\n</header>\n")
    );
}

#[test]
fn apply_with_invalid_plan_exits_invalid() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws.path().join("plan.json");
    fs::write(
        &plan,
        json!({"ops": [{"type": "rename_file", "path": "sections/header.liquid"}]}).to_string(),
    )
    .expect("plan");

    let output = agent()
        .current_dir(ws.path())
        .args(["apply", "--workdir"])
        .arg(ws.theme())
        .arg("--plan")
        .arg(&plan)
        .output()
        .expect("agent apply");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported type 'rename_file'"));
    assert_eq!(
        ws.read_theme_file("sections/header.liquid").expect("header"),
        HEADER_SECTION
    );
}

#[test]
fn run_without_api_key_exits_invalid() {
    let ws = TestWorkspace::new().expect("workspace");
    let status = agent()
        .current_dir(ws.path())
        .env_remove("OPENAI_API_KEY")
        .args(["run", "--workdir", "theme"])
        .status()
        .expect("agent run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
    assert!(!ws.runs().exists());
}

#[test]
fn run_without_task_exits_invalid() {
    let ws = TestWorkspace::new().expect("workspace");
    fs::remove_file(ws.tasks().join("task.md")).expect("remove task");
    let output = agent()
        .current_dir(ws.path())
        .env("OPENAI_API_KEY", "test-key")
        .args(["run", "--workdir", "theme"])
        .output()
        .expect("agent run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("task.md not found"));
}

#[test]
fn invalid_config_exits_invalid() {
    let ws = TestWorkspace::new().expect("workspace");
    fs::write(ws.path().join("agent.toml"), "[loop]\nmax_iters = \"many\"\n").expect("config");
    let status = agent()
        .current_dir(ws.path())
        .args(["baseline", "--workdir", "theme"])
        .status()
        .expect("agent baseline");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn baseline_without_record_succeeds() {
    let ws = TestWorkspace::new().expect("workspace");
    let output = agent()
        .current_dir(ws.path())
        .args(["baseline", "--workdir", "theme"])
        .output()
        .expect("agent baseline");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no baseline recorded"));
}
