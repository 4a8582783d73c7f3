//! Chat-completion client that turns a conversation into a bot program
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint (xAI by
//! default). Generation never fails from the caller's point of view: any
//! transport or decoding problem degrades to a fixed, safe example program.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use super::extract::extract_code;
use crate::metrics::{GENERATION_DURATION, GENERATION_REQUESTS};

/// Default chat-completion endpoint
pub const DEFAULT_API_URL: &str = "https://api.x.ai/v1/chat/completions";

/// Default model name
pub const DEFAULT_MODEL: &str = "grok-3";

/// Message shown when the completion endpoint cannot be used
pub const FALLBACK_MESSAGE: &str =
    "I could not reach the AI service. Here's a safe example that lists markets.";

/// Message used when the reply carried code but no surrounding prose
pub const DEFAULT_READY_MESSAGE: &str = "Generated code ready to review and execute.";

/// Minimal safe program returned whenever generation produced no code
pub const FALLBACK_PROGRAM: &str = r#"import os
from api_helpers import fetch_markets, place_order

DRY_RUN = os.getenv("DRY_RUN", "1") == "1"

def main():
    data = fetch_markets(limit=5)
    markets = data.get("markets") or data
    print(f"Fetched {len(markets)} markets (showing up to 5):")
    for m in markets[:5]:
        print(f"- {m.get('question') or m.get('slug')}")

if __name__ == "__main__":
    main()"#;

/// System policy sent ahead of every conversation
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert Polymarket trading bot generator. Output clean Python code ONLY when appropriate, wrapped in a single fenced code block like:
```python
# code
```

Constraints and Safety:
- Use only safe libraries available: requests, time, json, os, dotenv, websocket-client (if needed), pandas (optional). web3 usage should be placeholder-only.
- Import helpers from local api_helpers: fetch_markets, place_order, fetch_historical_data, stream_clob_prices,
  calculate_arbitrage_opportunity, position_size_simple, apply_stop_loss.
- Respect a DRY_RUN boolean from env or caller to avoid real trades. All live actions must gate on DRY_RUN == False.
- Add basic error handling and clear prints for logs. Prefer retry/backoff for network calls.
- Avoid using subprocess or OS shell. Never write files except ephemeral logs to stdout.

Polymarket APIs quick reference:
- Gamma REST: https://gamma-api.polymarket.com (markets, prices, volumes)
- CLOB Orders: https://clob.polymarket.com (REST/WebSocket). Do NOT place real orders; call place_order(..., dry_run=True).

Refinements:
- For iterative changes, output the FULL updated Python program each time (single fenced code block). Keep code idempotent and self-contained.
- Prefer functions with a main() entrypoint so the runner can execute."#;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One exchange of the conversation history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: String,
}

impl ConversationTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Outcome of a generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Natural-language part of the reply
    pub message: String,
    /// Program extracted from the reply (never empty after `chat`)
    pub code: String,
}

impl GenerationResult {
    /// The result used whenever the endpoint could not be used
    pub fn fallback() -> Self {
        Self {
            message: FALLBACK_MESSAGE.to_string(),
            code: FALLBACK_PROGRAM.to_string(),
        }
    }

    /// Build a result from raw reply text
    ///
    /// Substitutes the fallback program when the reply had no code block
    /// and a default sentence when it had no prose.
    pub fn from_reply(reply: &str) -> Self {
        let (code, remainder) = extract_code(reply);
        let code = if code.is_empty() {
            FALLBACK_PROGRAM.to_string()
        } else {
            code
        };
        let message = if remainder.is_empty() {
            DEFAULT_READY_MESSAGE.to_string()
        } else {
            remainder
        };
        Self { message, code }
    }
}

/// Configuration for the generation client
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Chat-completion endpoint URL
    pub api_url: String,
    /// Bearer token
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            request_timeout: Duration::from_secs(30),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// Error type for generation requests
#[derive(Debug)]
pub enum GenerationError {
    /// Connection, TLS or timeout failure
    Request(reqwest::Error),
    /// Endpoint answered with a non-success status
    Status { code: u16, body: String },
    /// Body was not the expected JSON shape
    Parse(serde_json::Error),
    /// Body parsed but carried no choices
    EmptyResponse,
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::Request(e) => write!(f, "Request error: {}", e),
            GenerationError::Status { code, body } => {
                write!(f, "Completion API error {}: {}", code, body)
            }
            GenerationError::Parse(e) => write!(f, "Parse error: {}", e),
            GenerationError::EmptyResponse => write!(f, "Empty response from completion API"),
        }
    }
}

impl std::error::Error for GenerationError {}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Request(e)
    }
}

impl From<serde_json::Error> for GenerationError {
    fn from(e: serde_json::Error) -> Self {
        GenerationError::Parse(e)
    }
}

/// Client for the hosted chat-completion endpoint
#[derive(Clone)]
pub struct GenerationClient {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl GenerationClient {
    /// Create a new generation client
    pub fn new(config: GenerationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Build the message list sent to the endpoint
    ///
    /// System prompt first, then each turn's non-empty user and assistant
    /// texts, then the new user input.
    pub fn build_messages(&self, user_input: &str, history: &[ConversationTurn]) -> Vec<ChatMessage> {
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage::system(system_prompt));
        for turn in history {
            if !turn.user.is_empty() {
                messages.push(ChatMessage::user(turn.user.as_str()));
            }
            if !turn.assistant.is_empty() {
                messages.push(ChatMessage::assistant(turn.assistant.as_str()));
            }
        }
        messages.push(ChatMessage::user(user_input));
        messages
    }

    /// Generate a program for `user_input`, falling back on any failure
    pub async fn chat(&self, user_input: &str, history: &[ConversationTurn]) -> GenerationResult {
        let start = Instant::now();
        let result = match self.try_chat(user_input, history).await {
            Ok(reply) => {
                GENERATION_REQUESTS.with_label_values(&["success"]).inc();
                GenerationResult::from_reply(&reply)
            }
            Err(e) => {
                warn!(error = %e, model = %self.config.model, "Generation failed, using fallback program");
                GENERATION_REQUESTS.with_label_values(&["fallback"]).inc();
                GenerationResult::fallback()
            }
        };
        GENERATION_DURATION.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Send one completion request and return the raw reply content
    pub async fn try_chat(
        &self,
        user_input: &str,
        history: &[ConversationTurn],
    ) -> Result<String, GenerationError> {
        let messages = self.build_messages(user_input, history);
        let span = info_span!(
            "llm_call",
            model = %self.config.model,
            messages = messages.len(),
            otel.name = "llm_call"
        );

        async {
            let body = CompletionRequest {
                model: &self.config.model,
                messages: &messages,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };

            let response = self
                .client
                .post(&self.config.api_url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() {
                return Err(GenerationError::Status {
                    code: status.as_u16(),
                    body: text.chars().take(500).collect(),
                });
            }

            let parsed: CompletionResponse = serde_json::from_str(&text)?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .ok_or(GenerationError::EmptyResponse)?;

            info!(reply_len = content.len(), "Completion received");
            Ok(content)
        }
        .instrument(span)
        .await
    }
}
