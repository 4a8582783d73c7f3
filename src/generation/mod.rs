//! Program generation module
//!
//! Sends the conversation to a hosted chat-completion endpoint and pulls the
//! generated program out of the reply.

pub mod client;
pub mod extract;

pub use client::{
    ChatMessage, ConversationTurn, GenerationClient, GenerationConfig, GenerationError,
    GenerationResult, DEFAULT_SYSTEM_PROMPT, FALLBACK_MESSAGE, FALLBACK_PROGRAM,
};
pub use extract::extract_code;
