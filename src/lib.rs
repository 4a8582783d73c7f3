//! Polyflow - conversational generator and sandbox for trading-bot programs
//!
//! Turns natural-language requests into Python programs through a hosted
//! chat-completion model, audits them statically, and runs them one at a
//! time as child processes with a wall-clock limit and external stop.
//!
//! # Modules
//!
//! - `generation` - chat-completion client and fenced-code extraction
//! - `audit` - static policy check (forbidden calls, import allowlist)
//! - `sandbox` - single-slot execution, buffered or streamed
//! - `agent` - orchestrator and persistent sessions
//! - `market` - market-data helpers and a read-only Gamma client
//! - `config` - environment configuration
//! - `metrics` - Prometheus metrics
//! - `tracing` - log and trace setup
//!
//! # Quick Start
//!
//! ```ignore
//! use polyflow::{SandboxConfig, SandboxExecutor};
//!
//! let executor = SandboxExecutor::new(SandboxConfig::default());
//! let request = executor.buffered_request("print('hi')", true);
//! let outcome = executor.execute(request).await?;
//! assert_eq!(outcome.stdout, "hi\n");
//! ```

pub mod agent;
pub mod audit;
pub mod config;
pub mod generation;
pub mod market;
pub mod metrics;
pub mod sandbox;
pub mod tracing;

pub use agent::{Orchestrator, OrchestratorError, Session, SessionStore};
pub use audit::{AuditPolicy, AuditReport, PatternAuditor};
pub use config::{Config, ConfigError};
pub use generation::{extract_code, ConversationTurn, GenerationClient, GenerationConfig, GenerationResult};
pub use sandbox::{
    BufferedOutcome, ExecutionRequest, ExecutionStream, OutputChunk, Rejection, SandboxConfig,
    SandboxExecutor, StopOutcome,
};
