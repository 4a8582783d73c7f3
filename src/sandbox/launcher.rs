//! Child process launch
//!
//! The executor never builds a shell string: the interpreter is started
//! directly on the script path. The [`ProcessLauncher`] seam exists so tests
//! (and alternative runtimes) can observe or replace the spawn.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Everything needed to start one generated program
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Interpreter binary (e.g. "python3")
    pub interpreter: String,
    /// Script written to the ephemeral directory
    pub script: PathBuf,
    /// Working directory of the child
    pub working_dir: PathBuf,
    /// Variables added on top of the inherited environment
    pub env: Vec<(String, String)>,
}

/// Starts a child process from a [`LaunchSpec`]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the child with stdout and stderr piped
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

/// Runs `<interpreter> <script>` in its own process group
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterLauncher;

impl ProcessLauncher for InterpreterLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(&spec.interpreter);
        cmd.arg(&spec.script)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // pgid = pid, so a kill reaches anything the script forks
            .process_group(0)
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.spawn()
    }
}
