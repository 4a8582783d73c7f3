//! Sandbox executor - audit, launch, supervise
//!
//! ```text
//! Idle ─► Auditing ─┬─► Rejected (policy / busy / empty)
//!                   └─► Launching ─► Running ─┬─► Completed
//!                                             ├─► TimedOut (killed)
//!                                             └─► Stopped  (killed)
//! ```
//!
//! A launched run is owned by a supervisor task. It holds the slot guard,
//! the temp directory and the child; all three are dropped before the
//! terminal chunk is sent, so a consumer that has seen the end of the stream
//! can immediately start the next run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use super::launcher::{InterpreterLauncher, LaunchSpec, ProcessLauncher};
use super::slot::{ExecutionSlot, SlotGuard};
use super::stream::{format_secs, ExecutionStream, LineReader, OutputChunk};
use crate::audit::{AuditPolicy, AuditReport, PatternAuditor};
use crate::metrics::{AUDIT_REJECTIONS, CODE_EXECUTIONS, CODE_EXECUTION_DURATION, SLOT_CONFLICTS};

/// File name of the materialized program inside the temp directory
pub const SCRIPT_FILE_NAME: &str = "generated_bot.py";

/// Environment flag read by generated programs
pub const DRY_RUN_ENV: &str = "DRY_RUN";

/// Buffered chunks between supervisor and consumer
const CHANNEL_CAPACITY: usize = 256;

/// Upper bound on waiting for a killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `stop()` waiting for the slot to be released
const STOP_WAIT: Duration = Duration::from_secs(10);

/// Configuration for the sandbox executor
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter used to run generated programs
    pub interpreter: String,
    /// Working directory of the child (where `api_helpers` lives)
    pub working_dir: PathBuf,
    /// Default limit for buffered runs
    pub buffered_timeout: Duration,
    /// Default limit for streamed runs
    pub stream_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            working_dir: PathBuf::from("."),
            buffered_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(45),
        }
    }
}

/// One request to run a program
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub source: String,
    /// Passed to the child as `DRY_RUN=1` / `DRY_RUN=0`
    pub dry_run: bool,
    /// Wall-clock limit measured from launch
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>, dry_run: bool, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            dry_run,
            timeout,
        }
    }
}

/// Why a request never reached the running state
#[derive(Debug)]
pub enum Rejection {
    /// Source was empty after trimming
    NothingToExecute,
    /// Static audit found violations
    Policy(AuditReport),
    /// Another run holds the slot
    Busy,
    /// Temp file or spawn failed
    Launch(std::io::Error),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NothingToExecute => write!(f, "Nothing to execute."),
            Rejection::Policy(report) => write!(f, "{}", report),
            Rejection::Busy => write!(
                f,
                "Another execution is in progress. Stop it or wait for it to finish."
            ),
            Rejection::Launch(e) => write!(f, "Failed to launch program: {}", e),
        }
    }
}

impl std::error::Error for Rejection {}

/// Outcome of a buffered run
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedOutcome {
    /// Captured stdout, one `\n` per line
    pub stdout: String,
    /// Captured stderr, one `\n` per line
    pub stderr: String,
    /// Terminal chunk of the run
    pub status: OutputChunk,
}

impl BufferedOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            OutputChunk::Exited { exit_code, .. } => exit_code,
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.status, OutputChunk::TimedOut { .. })
    }

    /// User-facing text for this outcome
    pub fn render(&self) -> String {
        match &self.status {
            OutputChunk::Exited {
                exit_code: Some(0), ..
            } => {
                if self.stdout.is_empty() {
                    "(no output)".to_string()
                } else {
                    self.stdout.clone()
                }
            }
            OutputChunk::Exited { exit_code, .. } => format!(
                "[EXIT {}]\nSTDERR:\n{}\n\nSTDOUT:\n{}",
                exit_code.unwrap_or(-1),
                self.stderr,
                self.stdout
            ),
            other => other.to_string(),
        }
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The run was killed and its slot released
    Stopped,
    NothingRunning,
    /// Stop was requested but the run still holds the slot
    Unresponsive,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Stopped => write!(f, "Execution stopped."),
            StopOutcome::NothingRunning => write!(f, "Nothing is running."),
            StopOutcome::Unresponsive => {
                write!(f, "Stop requested, but the program has not exited yet.")
            }
        }
    }
}

/// Runs audited programs one at a time
pub struct SandboxExecutor {
    config: SandboxConfig,
    policy: Arc<dyn AuditPolicy>,
    launcher: Arc<dyn ProcessLauncher>,
    slot: ExecutionSlot,
}

impl SandboxExecutor {
    /// Executor with the default audit policy, launcher and a fresh slot
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            policy: Arc::new(PatternAuditor::default()),
            launcher: Arc::new(InterpreterLauncher),
            slot: ExecutionSlot::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AuditPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Share `slot` with other executors
    pub fn with_slot(mut self, slot: ExecutionSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn slot(&self) -> &ExecutionSlot {
        &self.slot
    }

    /// Audit without running
    pub fn audit(&self, source: &str) -> AuditReport {
        self.policy.audit(source)
    }

    /// Request using the configured streaming timeout
    pub fn stream_request(&self, source: impl Into<String>, dry_run: bool) -> ExecutionRequest {
        ExecutionRequest::new(source, dry_run, self.config.stream_timeout)
    }

    /// Request using the configured buffered timeout
    pub fn buffered_request(&self, source: impl Into<String>, dry_run: bool) -> ExecutionRequest {
        ExecutionRequest::new(source, dry_run, self.config.buffered_timeout)
    }

    /// Start a run and stream its output line by line
    pub async fn execute_streaming(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionStream, Rejection> {
        self.launch(request, "stream")
    }

    /// Run to completion and return the captured output
    pub async fn execute(&self, request: ExecutionRequest) -> Result<BufferedOutcome, Rejection> {
        let mut stream = self.launch(request, "buffered")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut status = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                OutputChunk::Stdout(line) => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                OutputChunk::Stderr(line) => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                terminal => status = Some(terminal),
            }
        }

        Ok(BufferedOutcome {
            stdout,
            stderr,
            status: status
                .unwrap_or_else(|| OutputChunk::Failed("output stream closed early".to_string())),
        })
    }

    /// Kill the current run, if any, and wait for its slot to be released
    ///
    /// Returns [`StopOutcome::Stopped`] only once the run has given the slot
    /// back.
    pub async fn stop(&self) -> StopOutcome {
        let Some(mut pending) = self.slot.request_stop() else {
            return StopOutcome::NothingRunning;
        };
        // Resolves with Err once the guard (and its sender) is dropped
        let _ = tokio::time::timeout(STOP_WAIT, pending.released.changed()).await;

        let still_held = self
            .slot
            .current()
            .map(|run| run.run_id == pending.run_id)
            .unwrap_or(false);
        if still_held {
            warn!(run_id = %pending.run_id, "Run did not release the slot within {:?}", STOP_WAIT);
            return StopOutcome::Unresponsive;
        }
        StopOutcome::Stopped
    }

    fn launch(&self, request: ExecutionRequest, mode: &'static str) -> Result<ExecutionStream, Rejection> {
        if request.source.trim().is_empty() {
            return Err(Rejection::NothingToExecute);
        }

        let report = self.policy.audit(&request.source);
        if !report.is_clean() {
            AUDIT_REJECTIONS.inc();
            warn!(violations = report.violations().len(), "Program rejected by audit");
            return Err(Rejection::Policy(report));
        }

        let guard = self.slot.try_acquire().map_err(|busy| {
            SLOT_CONFLICTS.inc();
            info!(active_run = %busy.run_id, "Execution rejected, slot busy");
            Rejection::Busy
        })?;

        // From here on every early return drops `guard` and `workdir`
        let workdir = tempfile::Builder::new()
            .prefix("polyflow-")
            .tempdir()
            .map_err(Rejection::Launch)?;
        let script = workdir.path().join(SCRIPT_FILE_NAME);
        std::fs::write(&script, &request.source).map_err(Rejection::Launch)?;

        let spec = LaunchSpec {
            interpreter: self.config.interpreter.clone(),
            script,
            working_dir: self.config.working_dir.clone(),
            env: vec![
                (
                    DRY_RUN_ENV.to_string(),
                    if request.dry_run { "1" } else { "0" }.to_string(),
                ),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ],
        };

        let child = self.launcher.launch(&spec).map_err(|e| {
            warn!(error = %e, interpreter = %spec.interpreter, "Failed to spawn program");
            Rejection::Launch(e)
        })?;
        guard.set_pid(child.id());

        let run_id = guard.run_id().to_string();
        info!(
            run_id = %run_id,
            pid = ?child.id(),
            mode,
            dry_run = request.dry_run,
            timeout_secs = request.timeout.as_secs_f64(),
            "Program launched"
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stream = ExecutionStream::new(run_id.clone(), rx, guard.cancel_handle());

        let span = info_span!(
            "code_execution",
            run_id = %run_id,
            mode,
            otel.name = "code_execution"
        );
        let run = Supervisor {
            child,
            guard,
            workdir,
            timeout: request.timeout,
            mode,
        };

        // Outer task turns a supervisor panic into a Failed chunk
        let panic_tx = tx.clone();
        tokio::spawn(
            async move {
                if let Err(e) = tokio::spawn(run.run(tx).in_current_span()).await {
                    warn!(error = %e, "Supervisor task aborted");
                    CODE_EXECUTIONS.with_label_values(&[mode, "failed"]).inc();
                    let _ = panic_tx
                        .send(OutputChunk::Failed(format!("supervisor aborted: {}", e)))
                        .await;
                }
            }
            .instrument(span),
        );

        Ok(stream)
    }
}

/// Owns a running child until it reaches a terminal state
struct Supervisor {
    child: Child,
    guard: SlotGuard,
    workdir: tempfile::TempDir,
    timeout: Duration,
    mode: &'static str,
}

impl Supervisor {
    async fn run(self, tx: mpsc::Sender<OutputChunk>) {
        let Supervisor {
            mut child,
            guard,
            workdir,
            timeout,
            mode,
        } = self;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut cancel = guard.cancellation();
        let mut stdout = child.stdout.take().map(LineReader::new);
        let mut stderr = child.stderr.take().map(LineReader::new);
        // Set when the consumer dropped the stream
        let mut abandoned = false;

        let terminal = loop {
            if stdout.is_none() && stderr.is_none() {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => OutputChunk::Exited {
                                exit_code: status.code(),
                                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                            },
                            Err(e) => OutputChunk::Failed(format!("wait failed: {}", e)),
                        };
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        kill(&mut child).await;
                        break OutputChunk::TimedOut { after: timeout };
                    }
                    _ = cancelled(&mut cancel) => {
                        kill(&mut child).await;
                        break OutputChunk::Stopped;
                    }
                }
            }

            let mut pending = None;
            tokio::select! {
                line = next_line(&mut stdout) => match line {
                    Ok(Some(line)) => {
                        guard.record_output(&line);
                        pending = Some(OutputChunk::Stdout(line));
                    }
                    Ok(None) => stdout = None,
                    Err(e) => {
                        debug!(error = %e, "stdout read failed");
                        stdout = None;
                    }
                },
                line = next_line(&mut stderr) => match line {
                    Ok(Some(line)) => {
                        guard.record_output(&line);
                        pending = Some(OutputChunk::Stderr(line));
                    }
                    Ok(None) => stderr = None,
                    Err(e) => {
                        debug!(error = %e, "stderr read failed");
                        stderr = None;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    kill(&mut child).await;
                    break OutputChunk::TimedOut { after: timeout };
                }
                _ = cancelled(&mut cancel) => {
                    kill(&mut child).await;
                    break OutputChunk::Stopped;
                }
            }

            let Some(chunk) = pending else { continue };
            match deliver(&tx, chunk, deadline, &mut cancel).await {
                Delivery::Sent => {}
                Delivery::Abandoned => {
                    abandoned = true;
                    kill(&mut child).await;
                    break OutputChunk::Stopped;
                }
                Delivery::Deadline => {
                    kill(&mut child).await;
                    break OutputChunk::TimedOut { after: timeout };
                }
                Delivery::Cancelled => {
                    kill(&mut child).await;
                    break OutputChunk::Stopped;
                }
            }
        };

        let elapsed = started.elapsed();
        let status = match &terminal {
            OutputChunk::Exited {
                exit_code: Some(0), ..
            } => "success",
            OutputChunk::Exited { .. } => "error",
            OutputChunk::TimedOut { .. } => "timeout",
            OutputChunk::Stopped => "stopped",
            _ => "failed",
        };
        CODE_EXECUTIONS.with_label_values(&[mode, status]).inc();
        CODE_EXECUTION_DURATION
            .with_label_values(&[mode])
            .observe(elapsed.as_secs_f64());

        match &terminal {
            OutputChunk::TimedOut { after } => {
                warn!(run_id = %guard.run_id(), "Execution timed out after {}", format_secs(*after))
            }
            _ => info!(
                run_id = %guard.run_id(),
                status,
                duration_ms = elapsed.as_secs_f64() * 1000.0,
                "Execution finished"
            ),
        }

        // Release before announcing the end
        drop(stdout);
        drop(stderr);
        drop(child);
        if let Err(e) = workdir.close() {
            warn!(error = %e, "Failed to remove temp directory");
        }
        drop(guard);

        if !abandoned {
            let _ = tx.send(terminal).await;
        }
    }
}

/// How a line handed to the consumer was settled
enum Delivery {
    Sent,
    /// Consumer dropped the stream
    Abandoned,
    Deadline,
    Cancelled,
}

/// Send one chunk, giving up if the deadline or a stop arrives first
///
/// A consumer that stops reading fills the channel; waiting for capacity
/// must not hold off the timeout or a stop request.
async fn deliver(
    tx: &mpsc::Sender<OutputChunk>,
    chunk: OutputChunk,
    deadline: tokio::time::Instant,
    cancel: &mut watch::Receiver<bool>,
) -> Delivery {
    tokio::select! {
        permit = tx.reserve() => match permit {
            Ok(permit) => {
                permit.send(chunk);
                Delivery::Sent
            }
            Err(_) => Delivery::Abandoned,
        },
        _ = tokio::time::sleep_until(deadline) => Delivery::Deadline,
        _ = cancelled(cancel) => Delivery::Cancelled,
    }
}

/// Read from an optional reader; a closed stream never resolves
async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut Option<LineReader<R>>,
) -> std::io::Result<Option<String>> {
    match reader {
        Some(reader) => reader.next_line().await,
        None => std::future::pending().await,
    }
}

/// Resolves once a stop has been requested
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a stop request
            std::future::pending::<()>().await;
        }
    }
}

/// Force-kill the whole process group and reap the child
async fn kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!(error = %e, pid, "killpg failed, falling back to kill"),
        }
    }
    let _ = child.start_kill();
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!("Child did not exit within {:?} of SIGKILL", REAP_TIMEOUT);
    }
}
