//! Claude CLI worker against a fake `claude` shell script.
//!
//! Kept to a single test so no other test in this binary forks while the
//! scripts are being written.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use heavy_swarm::worker::ClaudeCliWorker;
use heavy_swarm::{ProviderKind, Worker, WorkerConfig, WorkerError};

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

fn config_for(script: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::new(ProviderKind::ClaudeCode, "claude-sonnet-4");
    config.cli_path = Some(script.display().to_string());
    config
}

#[tokio::test]
async fn fake_cli_stream_is_parsed_and_failures_are_reported() {
    let dir = tempfile::tempdir().unwrap();

    // Streams a short session and echoes the prompt argument back.
    let ok_script = dir.path().join("claude-ok");
    write_script(
        &ok_script,
        r#"if [ "$1" = "--help" ]; then echo "usage"; exit 0; fi
echo '{"type":"system","subtype":"init","model":"claude-sonnet-4"}'
echo 'garbage line'
echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"prompt was: $2\"}]}}"
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"python use_tool.py mark_task_complete"}}]}}'
echo '{"type":"result","subtype":"success","result":"done","total_cost_usd":0.002}'"#,
    );

    let mut worker = ClaudeCliWorker::from_config(&config_for(&ok_script))
        .await
        .unwrap();
    let answer = worker.run("2+2").await.unwrap();
    assert_eq!(answer, "prompt was: 2+2\n\ndone");
    worker.reset().await.unwrap();

    // Exits non-zero without any stream output.
    let failing_script = dir.path().join("claude-fail");
    write_script(&failing_script, r#"echo "auth required" >&2; exit 3"#);
    let mut worker = ClaudeCliWorker::unverified(&config_for(&failing_script)).unwrap();
    let err = worker.run("anything").await.unwrap_err();
    assert!(matches!(err, WorkerError::Process(_)));
    assert!(err.to_string().contains("auth required"));

    // `--help` failing means the CLI is unusable.
    let verify_err = ClaudeCliWorker::from_config(&config_for(&failing_script))
        .await
        .err()
        .unwrap();
    assert!(matches!(verify_err, WorkerError::Unavailable(_)));
}
