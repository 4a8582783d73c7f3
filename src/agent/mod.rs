//! Conversation front end
//!
//! ```text
//! user text ─► Orchestrator::send ─► GenerationClient ─► extract_code
//!                    │                                        │
//!                 Session (turns, current code) ◄─────────────┘
//!                    │
//!      execute_* (code present? live mode confirmed?)
//!                    │
//!              SandboxExecutor ─► ExecutionStream / BufferedOutcome
//! ```

pub mod orchestrator;
pub mod sessions;

pub use orchestrator::{
    assistant_turn_text, check_confirmation, Orchestrator, OrchestratorError, CONFIRMATION_PHRASE,
};
pub use sessions::{Session, SessionStore, SessionSummary};
