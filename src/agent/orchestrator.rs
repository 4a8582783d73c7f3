//! Orchestrator wiring generation to the sandbox
//!
//! Owns the conversation session and gates execution on the current
//! program and the live-mode confirmation.

use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::agent::sessions::Session;
use crate::generation::{ConversationTurn, GenerationClient, GenerationResult};
use crate::sandbox::{BufferedOutcome, ExecutionStream, Rejection, SandboxExecutor, StopOutcome};

/// Text that unlocks a live (non dry-run) execution
pub const CONFIRMATION_PHRASE: &str = "CONFIRM";

/// Error type for orchestrator operations
#[derive(Debug)]
pub enum OrchestratorError {
    /// No program has been generated yet
    NoCode,
    /// Live mode requested without the confirmation phrase
    LiveModeBlocked,
    /// The sandbox refused the request
    Rejected(Rejection),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::NoCode => write!(f, "No code to execute. Generate code first."),
            OrchestratorError::LiveModeBlocked => write!(
                f,
                "Live mode blocked: please type {} to proceed or toggle Dry-run.",
                CONFIRMATION_PHRASE
            ),
            OrchestratorError::Rejected(r) => write!(f, "{}", r),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<Rejection> for OrchestratorError {
    fn from(r: Rejection) -> Self {
        OrchestratorError::Rejected(r)
    }
}

/// Assistant text stored in history: the prose plus the program in a fence
pub fn assistant_turn_text(result: &GenerationResult) -> String {
    if result.code.is_empty() {
        result.message.clone()
    } else {
        format!("{}\n\n```python\n{}\n```", result.message, result.code)
    }
}

/// Check the live-mode confirmation
pub fn check_confirmation(dry_run: bool, confirmation: Option<&str>) -> Result<(), OrchestratorError> {
    if dry_run {
        return Ok(());
    }
    match confirmation {
        Some(text) if text.trim().eq_ignore_ascii_case(CONFIRMATION_PHRASE) => Ok(()),
        _ => Err(OrchestratorError::LiveModeBlocked),
    }
}

/// Conversation + execution front end
pub struct Orchestrator {
    generator: GenerationClient,
    executor: Arc<SandboxExecutor>,
    session: Session,
}

impl Orchestrator {
    pub fn new(generator: GenerationClient, executor: Arc<SandboxExecutor>) -> Self {
        let session = Session::new(generator.config().model.clone());
        Self {
            generator,
            executor,
            session,
        }
    }

    /// Resume a saved session
    pub fn with_session(mut self, session: Session) -> Self {
        self.resume(session);
        self
    }

    /// Replace the current conversation with a saved one
    pub fn resume(&mut self, session: Session) {
        info!(session_id = %session.id, turns = session.turns.len(), "Session resumed");
        self.session = session;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.session.turns
    }

    pub fn current_code(&self) -> &str {
        &self.session.current_code
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    /// Generate (or refine) a program from `user_input`
    ///
    /// Never fails: transport problems yield the fallback result. The turn is
    /// appended to history and a non-empty program becomes the current code.
    pub async fn send(&mut self, user_input: &str) -> GenerationResult {
        let span = info_span!(
            "chat_turn",
            session_id = %self.session.id,
            turn = self.session.turns.len(),
            otel.name = "chat_turn"
        );
        let result = self
            .generator
            .chat(user_input, &self.session.turns)
            .instrument(span)
            .await;

        if !result.code.is_empty() {
            self.session.set_code(result.code.clone());
        }
        self.session
            .push_turn(ConversationTurn::new(user_input, assistant_turn_text(&result)));
        info!(
            session_id = %self.session.id,
            turns = self.session.turns.len(),
            code_len = result.code.len(),
            "Conversation turn recorded"
        );
        result
    }

    fn gate(&self, dry_run: bool, confirmation: Option<&str>) -> Result<&str, OrchestratorError> {
        let code = self.session.current_code.trim();
        if code.is_empty() {
            return Err(OrchestratorError::NoCode);
        }
        check_confirmation(dry_run, confirmation)?;
        Ok(&self.session.current_code)
    }

    /// Run the current program with streamed output
    pub async fn execute_streaming(
        &self,
        dry_run: bool,
        confirmation: Option<&str>,
    ) -> Result<ExecutionStream, OrchestratorError> {
        let code = self.gate(dry_run, confirmation)?;
        let request = self.executor.stream_request(code, dry_run);
        Ok(self.executor.execute_streaming(request).await?)
    }

    /// Run the current program to completion
    pub async fn execute_buffered(
        &self,
        dry_run: bool,
        confirmation: Option<&str>,
    ) -> Result<BufferedOutcome, OrchestratorError> {
        let code = self.gate(dry_run, confirmation)?;
        let request = self.executor.buffered_request(code, dry_run);
        Ok(self.executor.execute(request).await?)
    }

    pub async fn stop(&self) -> StopOutcome {
        self.executor.stop().await
    }

    /// Start a fresh session with the same model
    pub fn clear(&mut self) {
        self.session = Session::new(self.session.model.clone());
    }
}
