//! Execution slot - the single system-wide run handle
//!
//! At most one generated program runs at a time. The slot holds the
//! [`RunHandle`] of that program; acquiring it is non-blocking and a second
//! caller is turned away rather than queued.
//!
//! ```text
//! try_acquire() ──► SlotGuard ──(moved into supervisor task)──► drop
//!      │                                                         │
//!      └─ busy ──► SlotBusy                        slot cleared, released
//! ```
//!
//! The guard is RAII: whatever path the supervisor leaves by (exit,
//! timeout, stop, error, panic) dropping it frees the slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::metrics::EXECUTIONS_IN_FLIGHT;

/// Output lines kept on the run handle (oldest dropped first)
const MAX_RETAINED_LINES: usize = 10_000;

/// Record of the in-flight child process
pub struct RunHandle {
    /// Unique identifier for this run (UUID v7, time-sortable)
    pub run_id: String,
    /// OS process id, once spawned
    pub pid: Option<u32>,
    /// When the slot was acquired
    pub started_at: Instant,
    /// Lines emitted so far, both streams
    pub output: VecDeque<String>,
    cancel: Arc<watch::Sender<bool>>,
    released: watch::Receiver<()>,
}

/// Point-in-time view of the running program
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub run_id: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
    pub output_lines: usize,
}

/// Returned when the slot is already held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBusy {
    /// Run currently holding the slot
    pub run_id: String,
}

impl std::fmt::Display for SlotBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "execution slot held by run {}", self.run_id)
    }
}

impl std::error::Error for SlotBusy {}

/// Shared single-run slot
///
/// Clones share the same slot, so every executor built from one slot obeys
/// the same one-at-a-time rule.
#[derive(Clone, Default)]
pub struct ExecutionSlot {
    inner: Arc<Mutex<Option<RunHandle>>>,
}

impl ExecutionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunHandle>> {
        // A panic while holding the lock cannot leave the Option half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the slot, failing immediately if another run holds it
    pub fn try_acquire(&self) -> Result<SlotGuard, SlotBusy> {
        let mut current = self.lock();
        if let Some(handle) = current.as_ref() {
            return Err(SlotBusy {
                run_id: handle.run_id.clone(),
            });
        }

        let run_id = Uuid::now_v7().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (released_tx, released_rx) = watch::channel(());
        let cancel = Arc::new(cancel_tx);

        *current = Some(RunHandle {
            run_id: run_id.clone(),
            pid: None,
            started_at: Instant::now(),
            output: VecDeque::new(),
            cancel: cancel.clone(),
            released: released_rx,
        });
        EXECUTIONS_IN_FLIGHT.set(1.0);

        Ok(SlotGuard {
            slot: self.clone(),
            run_id,
            cancel,
            cancel_rx,
            _released: released_tx,
        })
    }

    /// True while a run holds the slot
    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    /// Snapshot of the current run, if any
    pub fn current(&self) -> Option<RunInfo> {
        self.lock().as_ref().map(|handle| RunInfo {
            run_id: handle.run_id.clone(),
            pid: handle.pid,
            elapsed: handle.started_at.elapsed(),
            output_lines: handle.output.len(),
        })
    }

    /// Last `n` output lines of the current run
    pub fn recent_output(&self, n: usize) -> Vec<String> {
        self.lock()
            .as_ref()
            .map(|handle| {
                let skip = handle.output.len().saturating_sub(n);
                handle.output.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Signal the current run to stop
    ///
    /// Returns `None` when nothing is running.
    pub(crate) fn request_stop(&self) -> Option<PendingStop> {
        let current = self.lock();
        let handle = current.as_ref()?;
        let _ = handle.cancel.send(true);
        Some(PendingStop {
            run_id: handle.run_id.clone(),
            released: handle.released.clone(),
        })
    }
}

/// A stop that has been signalled but not yet observed
pub(crate) struct PendingStop {
    pub(crate) run_id: String,
    /// Resolves (with an error) once the run's guard is dropped
    pub(crate) released: watch::Receiver<()>,
}

/// Ownership of the slot for one run
pub struct SlotGuard {
    slot: ExecutionSlot,
    run_id: String,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    // Dropped after the slot is cleared; wakes `request_stop` waiters
    _released: watch::Sender<()>,
}

impl SlotGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Attach the spawned process id to the run handle
    pub fn set_pid(&self, pid: Option<u32>) {
        if let Some(handle) = self.slot.lock().as_mut() {
            handle.pid = pid;
        }
    }

    /// Append one output line to the run handle
    pub fn record_output(&self, line: &str) {
        if let Some(handle) = self.slot.lock().as_mut() {
            if handle.output.len() == MAX_RETAINED_LINES {
                handle.output.pop_front();
            }
            handle.output.push_back(line.to_string());
        }
    }

    /// Receiver that flips to `true` when a stop is requested
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Sender that requests a stop for this run
    pub fn cancel_handle(&self) -> Arc<watch::Sender<bool>> {
        self.cancel.clone()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut current = self.slot.lock();
        if current.as_ref().map(|h| h.run_id == self.run_id).unwrap_or(false) {
            *current = None;
        }
        EXECUTIONS_IN_FLIGHT.set(0.0);
    }
}
