//! Smoke tests running the `chatlog` binary end to end

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const EXPORT: &str = r#"[
  {
    "id": "c-good",
    "title": "Rust: lifetimes?",
    "create_time": 1700000000.0,
    "update_time": 1700000900.0,
    "current_node": "a1",
    "mapping": {
      "root": {"id": "root", "parent": null, "children": ["u1"], "message": null},
      "u1": {"id": "u1", "parent": "root", "children": ["a1"], "message": {
        "author": {"role": "user"},
        "content": {"content_type": "text", "parts": ["What is a lifetime?"]}
      }},
      "a1": {"id": "a1", "parent": "u1", "children": [], "message": {
        "author": {"role": "assistant"},
        "content": {"content_type": "text", "parts": ["A region of code where a reference is valid."]}
      }}
    }
  },
  {"id": "c-bad", "title": "No mapping"}
]"#;

fn chatlog(config_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("chatlog").unwrap();
    cmd.env("CHATLOG_CONFIG", config_dir.join("absent.toml"))
        .env_remove("RUST_LOG")
        .arg("--quiet");
    cmd
}

fn write_export(dir: &TempDir) -> std::path::PathBuf {
    let input = dir.path().join("conversations.json");
    fs::write(&input, EXPORT).unwrap();
    input
}

#[test]
fn test_extract_help() {
    let dir = TempDir::new().unwrap();
    chatlog(dir.path())
        .arg("extract")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--json-mode"));
}

#[test]
fn test_extract_writes_transcripts_and_reports() {
    let dir = TempDir::new().unwrap();
    let input = write_export(&dir);
    let out = dir.path().join("out");

    chatlog(dir.path())
        .arg("extract")
        .arg(&input)
        .arg(&out)
        .args(["--json-mode", "multiple", "--jobs", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Successfully processed: 1"))
        .stdout(predicate::str::contains("Failed: 1"));

    let md = fs::read_to_string(out.join("md/Rust_ lifetimes_.md")).unwrap();
    assert!(md.contains("## Assistant\n\nA region of code where a reference is valid.\n"));
    assert!(out.join("json/Rust_ lifetimes_.json").exists());
    assert!(out.join("schema_evolution.log").exists());
    assert!(out.join("extraction.log").exists());

    let failures = fs::read_to_string(out.join("conversion_failures.json")).unwrap();
    assert!(failures.contains("missing_mapping"));
}

#[test]
fn test_extract_single_json_file() {
    let dir = TempDir::new().unwrap();
    let input = write_export(&dir);
    let out = dir.path().join("out");
    let export = dir.path().join("all.json");

    chatlog(dir.path())
        .arg("extract")
        .arg(&input)
        .arg(&out)
        .args(["--format", "json", "--no-log-file", "--json-file"])
        .arg(&export)
        .assert()
        .success();

    let body: serde_json::Value = serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
    assert_eq!(body["export_metadata"]["successful_conversations"], 1);
    assert_eq!(body["conversations"][0]["messages"][0]["role"], "user");
    assert!(!out.join("md").exists());
    assert!(!out.join("extraction.log").exists());
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = write_export(&dir);
    let out = dir.path().join("out");

    chatlog(dir.path())
        .arg("extract")
        .arg(&input)
        .arg(&out)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY RUN"));
    assert!(!out.exists());
}

#[test]
fn test_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    chatlog(dir.path())
        .arg("extract")
        .arg(dir.path().join("nope.json"))
        .arg(dir.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load export"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "format = [").unwrap();
    let input = write_export(&dir);

    chatlog(dir.path())
        .env("CHATLOG_CONFIG", &config)
        .arg("extract")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn test_schema_reports_unknown_content_type() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("conversations.json");
    let export = EXPORT.replace(
        r#""content_type": "text", "parts": ["A region"#,
        r#""content_type": "hologram", "parts": ["A region"#,
    );
    fs::write(&input, export).unwrap();

    chatlog(dir.path())
        .arg("schema")
        .arg(&input)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("hologram"));
}

#[test]
fn test_completions_bash() {
    let dir = TempDir::new().unwrap();
    chatlog(dir.path())
        .arg("completions")
        .arg("bash")
        .assert()
        .success()
        .stdout(predicate::str::contains("chatlog"));
}
