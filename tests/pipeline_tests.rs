//! Integration tests for the generate → audit → execute pipeline
//!
//! Sandbox timing tests use `/bin/sh` as the interpreter so they run
//! anywhere. Tests that need `python3` return early when it is missing.
//! HTTP tests talk to a throwaway local responder, never the network.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Child;

use polyflow::agent::{Orchestrator, OrchestratorError};
use polyflow::generation::{GenerationClient, GenerationConfig, GenerationError, GenerationResult};
use polyflow::market::{compute_mid_price, MarketClient, RetryPolicy};
use polyflow::sandbox::{
    ExecutionRequest, InterpreterLauncher, LaunchSpec, OutputChunk, ProcessLauncher, Rejection,
    SandboxConfig, SandboxExecutor, StopOutcome,
};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn sh_config() -> SandboxConfig {
    SandboxConfig {
        interpreter: "/bin/sh".to_string(),
        working_dir: std::env::temp_dir(),
        ..Default::default()
    }
}

fn sh_executor() -> SandboxExecutor {
    SandboxExecutor::new(sh_config())
}

fn request(source: &str, timeout_secs: u64) -> ExecutionRequest {
    ExecutionRequest::new(source, true, Duration::from_secs(timeout_secs))
}

/// Counts spawns, then delegates to the real launcher
#[derive(Default)]
struct SpyLauncher {
    launches: AtomicUsize,
}

impl ProcessLauncher for SpyLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        InterpreterLauncher.launch(spec)
    }
}

/// Remembers where each script was written, then delegates
#[derive(Default)]
struct RecordingLauncher {
    scripts: Mutex<Vec<PathBuf>>,
}

impl RecordingLauncher {
    fn last_workdir(&self) -> PathBuf {
        let scripts = self.scripts.lock().unwrap();
        let script = scripts.last().expect("no script was launched");
        script.parent().unwrap().to_path_buf()
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        self.scripts.lock().unwrap().push(spec.script.clone());
        InterpreterLauncher.launch(spec)
    }
}

fn assert_removed(workdir: &Path) {
    assert!(
        workdir
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("polyflow-"))
            .unwrap_or(false),
        "unexpected workdir {:?}",
        workdir
    );
    assert!(!workdir.exists(), "{:?} was left behind", workdir);
}

/// Shell program that prints `lines` lines, then sleeps
fn chatty_program(lines: usize, sleep_secs: u64) -> String {
    format!(
        "i=0\nwhile [ $i -lt {} ]; do echo line $i; i=$((i+1)); done\nsleep {}",
        lines, sleep_secs
    )
}

/// Wait until the run has produced more output than the stream can buffer
async fn wait_for_backpressure(executor: &SandboxExecutor) {
    for _ in 0..100 {
        let lines = executor
            .slot()
            .current()
            .map(|run| run.output_lines)
            .unwrap_or(0);
        if lines > 256 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run never filled the output channel");
}

/// Serves one canned HTTP response per connection, in order, and returns
/// the raw requests it received.
async fn serve(responses: Vec<(u16, String)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);

            let response = format!(
                "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
        requests
    });

    (format!("http://{}", addr), handle)
}

/// Read headers plus a Content-Length body
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= header_end + 4 + content_length {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn completion_body(content: &str) -> String {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox
// ─────────────────────────────────────────────────────────────────────────────

/// print('hi') runs to completion with exit code 0
#[tokio::test]
async fn test_python_print_hi() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let executor = SandboxExecutor::new(SandboxConfig {
        working_dir: std::env::temp_dir(),
        ..Default::default()
    });

    let outcome = executor
        .execute(executor.buffered_request("print('hi')", true))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "hi\n");
    assert_eq!(outcome.exit_code(), Some(0));
    assert_eq!(outcome.render(), "hi\n");
    assert!(!executor.slot().is_busy());
}

/// A program importing subprocess is rejected and never spawned
#[tokio::test]
async fn test_forbidden_import_never_launches() {
    let spy = Arc::new(SpyLauncher::default());
    let executor = sh_executor().with_launcher(spy.clone());

    let result = executor
        .execute_streaming(request("import subprocess\nsubprocess.run(['ls'])", 5))
        .await;

    let Err(Rejection::Policy(report)) = result else {
        panic!("expected a policy rejection");
    };
    assert!(!report.is_clean());
    assert!(report.violations().iter().any(|v| v.contains("subprocess")));
    assert_eq!(spy.launches.load(Ordering::SeqCst), 0);
    assert!(!executor.slot().is_busy());
}

#[tokio::test]
async fn test_clean_program_is_launched_once() {
    let spy = Arc::new(SpyLauncher::default());
    let executor = sh_executor().with_launcher(spy.clone());

    let outcome = executor.execute(request("echo ok", 5)).await.unwrap();

    assert_eq!(outcome.stdout, "ok\n");
    assert_eq!(spy.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_long_running_program_times_out() {
    let executor = sh_executor();
    let started = Instant::now();

    let outcome = executor
        .execute(ExecutionRequest::new("sleep 5", true, Duration::from_secs(1)))
        .await
        .unwrap();

    assert!(outcome.timed_out());
    assert_eq!(outcome.render(), "Execution timed out after 1s");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "timeout took {:?}",
        started.elapsed()
    );
    assert!(!executor.slot().is_busy());
}

#[tokio::test]
async fn test_second_execution_is_rejected_immediately() {
    let executor = sh_executor();

    let mut first = executor
        .execute_streaming(request("sleep 1\necho done", 10))
        .await
        .unwrap();
    assert!(executor.slot().is_busy());

    let started = Instant::now();
    let second = executor.execute_streaming(request("echo hi", 10)).await;
    assert!(matches!(second, Err(Rejection::Busy)));
    assert!(started.elapsed() < Duration::from_millis(500));

    // First run is undisturbed
    let mut chunks = Vec::new();
    while let Some(chunk) = first.next().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks.first(), Some(&OutputChunk::Stdout("done".to_string())));
    assert!(matches!(
        chunks.last(),
        Some(OutputChunk::Exited { exit_code: Some(0), .. })
    ));

    // Slot is free as soon as the terminal chunk has been seen
    assert!(!executor.slot().is_busy());
    let third = executor.execute(request("echo again", 10)).await.unwrap();
    assert_eq!(third.stdout, "again\n");
}

#[tokio::test]
async fn test_stop_kills_running_program() {
    let executor = sh_executor();
    let mut stream = executor
        .execute_streaming(request("echo started\nsleep 30", 60))
        .await
        .unwrap();

    assert_eq!(
        stream.next().await,
        Some(OutputChunk::Stdout("started".to_string()))
    );

    let started = Instant::now();
    assert_eq!(executor.stop().await, StopOutcome::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!executor.slot().is_busy());

    assert_eq!(stream.next().await, Some(OutputChunk::Stopped));
    assert_eq!(stream.next().await, None);
    assert_eq!(executor.stop().await, StopOutcome::NothingRunning);
}

#[tokio::test]
async fn test_stdout_lines_arrive_in_order() {
    let executor = sh_executor();
    let stream = executor
        .execute_streaming(request("echo one\necho two\necho three", 10))
        .await
        .unwrap();

    use futures_util::StreamExt;
    let lines: Vec<String> = stream.lines().collect().await;

    assert_eq!(&lines[..3], &["one", "two", "three"]);
    assert_eq!(lines.len(), 4);
    assert!(lines[3].starts_with("[exit 0] finished in "));
}

#[tokio::test]
async fn test_nonzero_exit_is_surfaced() {
    let executor = sh_executor();
    let outcome = executor
        .execute(request("echo partial\necho oops >&2\nexit 3", 10))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), Some(3));
    assert_eq!(outcome.stderr, "oops\n");
    assert_eq!(
        outcome.render(),
        "[EXIT 3]\nSTDERR:\noops\n\n\nSTDOUT:\npartial\n"
    );
}

#[tokio::test]
async fn test_dry_run_flag_reaches_child() {
    let executor = sh_executor();

    let dry = executor
        .execute(ExecutionRequest::new("echo $DRY_RUN", true, Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(dry.stdout, "1\n");

    let live = executor
        .execute(ExecutionRequest::new("echo $DRY_RUN", false, Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(live.stdout, "0\n");
}

#[tokio::test]
async fn test_missing_interpreter_releases_slot() {
    let executor = SandboxExecutor::new(SandboxConfig {
        interpreter: "/nonexistent/interpreter".to_string(),
        ..sh_config()
    });

    let result = executor.execute(request("echo hi", 5)).await;

    assert!(matches!(result, Err(Rejection::Launch(_))));
    assert!(!executor.slot().is_busy());
}

#[tokio::test]
async fn test_streamed_run_times_out() {
    let executor = sh_executor();
    let stream = executor
        .execute_streaming(ExecutionRequest::new("echo tick\nsleep 5", true, Duration::from_secs(1)))
        .await
        .unwrap();

    use futures_util::StreamExt;
    let chunks: Vec<OutputChunk> = stream.collect().await;

    assert_eq!(chunks.first(), Some(&OutputChunk::Stdout("tick".to_string())));
    assert_eq!(
        chunks.last(),
        Some(&OutputChunk::TimedOut { after: Duration::from_secs(1) })
    );
    assert!(!executor.slot().is_busy());
}

/// An unread stream must not hold off the deadline
#[tokio::test]
async fn test_timeout_fires_while_consumer_is_not_reading() {
    let launcher = Arc::new(RecordingLauncher::default());
    let executor = sh_executor().with_launcher(launcher.clone());

    let mut stream = executor
        .execute_streaming(ExecutionRequest::new(
            chatty_program(2000, 30),
            true,
            Duration::from_secs(1),
        ))
        .await
        .unwrap();

    // 2000 lines overflow the stream buffer well before the deadline
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!executor.slot().is_busy());
    assert_removed(&launcher.last_workdir());

    // Buffered lines are still delivered, then the timeout
    let mut last = None;
    while let Some(chunk) = stream.next().await {
        last = Some(chunk);
    }
    assert_eq!(last, Some(OutputChunk::TimedOut { after: Duration::from_secs(1) }));
}

/// An unread stream must not hold off a stop request
#[tokio::test]
async fn test_stop_releases_slot_while_consumer_is_not_reading() {
    let executor = sh_executor();

    let _stream = executor
        .execute_streaming(ExecutionRequest::new(
            chatty_program(2000, 30),
            true,
            Duration::from_secs(60),
        ))
        .await
        .unwrap();
    wait_for_backpressure(&executor).await;

    let started = Instant::now();
    assert_eq!(executor.stop().await, StopOutcome::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!executor.slot().is_busy());
}

#[tokio::test]
async fn test_temp_dir_removed_on_every_exit_path() {
    let launcher = Arc::new(RecordingLauncher::default());
    let executor = sh_executor().with_launcher(launcher.clone());

    // Normal exit
    let outcome = executor.execute(request("echo ok", 5)).await.unwrap();
    assert_eq!(outcome.exit_code(), Some(0));
    assert_removed(&launcher.last_workdir());

    // Non-zero exit
    let outcome = executor.execute(request("exit 4", 5)).await.unwrap();
    assert_eq!(outcome.exit_code(), Some(4));
    assert_removed(&launcher.last_workdir());

    // Timeout
    let outcome = executor
        .execute(ExecutionRequest::new("sleep 5", true, Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(outcome.timed_out());
    assert_removed(&launcher.last_workdir());

    // Stop
    let mut stream = executor
        .execute_streaming(request("echo started\nsleep 30", 60))
        .await
        .unwrap();
    assert_eq!(stream.next().await, Some(OutputChunk::Stdout("started".to_string())));
    assert_eq!(executor.stop().await, StopOutcome::Stopped);
    assert_removed(&launcher.last_workdir());

    // Launch failure
    let failing = SandboxExecutor::new(SandboxConfig {
        interpreter: "/nonexistent/interpreter".to_string(),
        ..sh_config()
    })
    .with_launcher(launcher.clone());
    let result = failing.execute(request("echo hi", 5)).await;
    assert!(matches!(result, Err(Rejection::Launch(_))));
    assert_removed(&launcher.last_workdir());

    assert_eq!(launcher.scripts.lock().unwrap().len(), 5);
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Unreachable endpoint yields the fallback result verbatim
#[tokio::test]
async fn test_unreachable_endpoint_falls_back() {
    let client = GenerationClient::new(GenerationConfig {
        api_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
        api_key: "unused".to_string(),
        ..Default::default()
    });

    let result = client.chat("anything", &[]).await;

    assert_eq!(result, GenerationResult::fallback());
}

#[tokio::test]
async fn test_generation_success_extracts_code() {
    let reply = "Lists open markets.\n```python\nprint('markets')\n```";
    let (base, server) = serve(vec![(200, completion_body(reply))]).await;
    let client = GenerationClient::new(GenerationConfig {
        api_url: format!("{}/v1/chat/completions", base),
        api_key: "test-key".to_string(),
        ..Default::default()
    });

    let result = client.chat("list markets", &[]).await;

    assert_eq!(result.code, "print('markets')");
    assert_eq!(result.message, "Lists open markets.");

    let requests = server.await.unwrap();
    let raw = &requests[0];
    assert!(raw.starts_with("POST /v1/chat/completions"));
    assert!(raw.to_ascii_lowercase().contains("authorization: bearer test-key"));
    assert!(raw.contains("\"model\":\"grok-3\""));
    assert!(raw.contains("list markets"));
}

#[tokio::test]
async fn test_generation_error_status() {
    let (base, _server) = serve(vec![(500, "{\"error\":\"overloaded\"}".to_string())]).await;
    let client = GenerationClient::new(GenerationConfig {
        api_url: format!("{}/v1/chat/completions", base),
        ..Default::default()
    });

    let err = client.try_chat("hi", &[]).await.unwrap_err();

    match err {
        GenerationError::Status { code, body } => {
            assert_eq!(code, 500);
            assert!(body.contains("overloaded"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_orchestrator_generate_then_run() {
    let reply = "Prints a greeting.\n```python\necho from-orchestrator\n```";
    let (base, _server) = serve(vec![(200, completion_body(reply))]).await;
    let generator = GenerationClient::new(GenerationConfig {
        api_url: format!("{}/v1/chat/completions", base),
        ..Default::default()
    });
    let mut orchestrator = Orchestrator::new(generator, Arc::new(sh_executor()));

    let result = orchestrator.send("say hello").await;
    assert_eq!(result.code, "echo from-orchestrator");
    assert_eq!(
        orchestrator.history()[0].assistant,
        "Prints a greeting.\n\n```python\necho from-orchestrator\n```"
    );

    let blocked = orchestrator.execute_buffered(false, Some("please")).await;
    assert!(matches!(blocked, Err(OrchestratorError::LiveModeBlocked)));

    let outcome = orchestrator.execute_buffered(true, None).await.unwrap();
    assert_eq!(outcome.stdout, "from-orchestrator\n");

    let live = orchestrator
        .execute_buffered(false, Some("confirm"))
        .await
        .unwrap();
    assert_eq!(live.exit_code(), Some(0));
}

// ─────────────────────────────────────────────────────────────────────────────
// Market
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_mid_price() {
    let mid = compute_mid_price(&json!({"best_bid": 0.4, "best_ask": 0.6})).unwrap();
    assert!((mid - 0.5).abs() < 1e-9);
    assert_eq!(compute_mid_price(&json!({"best_bid": 0.0, "best_ask": 0.6})), None);
}

#[tokio::test]
async fn test_fetch_markets_retries_transient_status() {
    let (base, server) = serve(vec![
        (503, "{}".to_string()),
        (200, json!([{"id": "1", "question": "Will it rain?"}]).to_string()),
    ])
    .await;
    let client = MarketClient::with_retry(
        base,
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let markets = client.fetch_markets(Some("rain"), 500).await.unwrap();

    assert_eq!(markets[0]["question"], "Will it rain?");
    let requests = server.await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].starts_with("GET /markets?limit=100&query=rain"));
}

#[tokio::test]
async fn test_history_unavailable_is_not_an_error() {
    let client = MarketClient::with_retry(
        "http://127.0.0.1:9",
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        },
    );

    let history = client.fetch_historical_data("123", 10).await;

    assert_eq!(history["status"], "unavailable");
    assert!(history["message"].is_string());
}
