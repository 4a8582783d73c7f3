//! Sandboxed execution of generated programs
//!
//! This module runs audited source as a child process:
//! - `slot` - the single system-wide run handle
//! - `launcher` - direct interpreter spawn (no shell)
//! - `stream` - incremental output and its terminal states
//! - `executor` - audit → launch → supervise, buffered or streamed
//!
//! # Architecture
//!
//! ```text
//! ExecutionRequest ─► AuditPolicy ─► ExecutionSlot::try_acquire
//!                                          │
//!                                   TempDir + spawn
//!                                          │
//!                         Supervisor task (owns child, guard, temp dir)
//!                           │   select: stdout | stderr | deadline | stop
//!                           ▼
//!                    mpsc ─► ExecutionStream::next() ─► caller
//! ```
//!
//! Containment is limited to process isolation, a process-group kill on
//! timeout or stop, and the static audit. There is no seccomp, namespace or
//! filesystem jail at this layer.

pub mod executor;
pub mod launcher;
pub mod slot;
pub mod stream;

pub use executor::{
    BufferedOutcome, ExecutionRequest, Rejection, SandboxConfig, SandboxExecutor, StopOutcome,
    DRY_RUN_ENV, SCRIPT_FILE_NAME,
};
pub use launcher::{InterpreterLauncher, LaunchSpec, ProcessLauncher};
pub use slot::{ExecutionSlot, RunHandle, RunInfo, SlotBusy, SlotGuard};
pub use stream::{ExecutionStream, OutputChunk};
