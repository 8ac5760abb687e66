use std::sync::{Arc, Mutex};

use fog::process::{run, run_shell, run_streaming, tail_for_error};
use fog::AppError;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn run_shell_captures_combined_output_and_success() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let output = run_shell(&cancel, dir.path(), "echo hello").await.unwrap();
    assert!(output.success);
    assert_eq!(String::from_utf8_lossy(&output.combined).trim(), "hello");
}

#[tokio::test]
async fn run_shell_reports_nonzero_exit_as_unsuccessful() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let output = run_shell(&cancel, dir.path(), "exit 3").await.unwrap();
    assert!(!output.success);
}

#[tokio::test]
async fn run_rejects_already_cancelled_token_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = run(&cancel, dir.path(), "echo", &["should not run"]).await;
    assert!(matches!(result, Err(AppError::Canceled)));
}

#[tokio::test]
async fn run_escalates_to_kill_when_cancelled_mid_flight() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let handle = tokio::spawn(async move {
        run(&cancel_clone, dir.path(), "sleep", &["30"]).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("run should return promptly after cancellation")
        .unwrap();
    assert!(matches!(result, Err(AppError::Canceled)));
}

#[tokio::test]
async fn run_reports_spawn_failure_for_unknown_binary() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let result = run(&cancel, dir.path(), "definitely-not-a-real-binary", &[]).await;
    assert!(matches!(result, Err(AppError::Subprocess(_))));
}

#[tokio::test]
async fn run_streaming_invokes_callback_per_line_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&lines);

    let output = run_streaming(&cancel, dir.path(), "printf", &["a\\nb\\nc\\n"], move |line| {
        collector.lock().unwrap().push(line.to_string());
    })
    .await
    .unwrap();

    assert!(output.success);
    let seen = lines.lock().unwrap();
    assert_eq!(*seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
}

#[test]
fn tail_for_error_passes_through_short_text() {
    assert_eq!(tail_for_error(b"short message", 100), "short message");
}

#[test]
fn tail_for_error_truncates_and_marks_long_text() {
    let long = "x".repeat(50);
    let result = tail_for_error(long.as_bytes(), 10);
    assert!(result.starts_with('…'));
    assert_eq!(result.chars().count(), 11);
}
