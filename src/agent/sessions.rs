//! Persistent conversation sessions
//!
//! Allows saving and resuming a generation conversation to/from disk.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::generation::ConversationTurn;

/// A saved conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID (UUID v7)
    pub id: String,
    /// Creation time, seconds since the Unix epoch
    pub created_at: u64,
    /// Last update, seconds since the Unix epoch
    pub updated_at: u64,
    /// Model used for generation
    pub model: String,
    /// Conversation history, oldest first
    pub turns: Vec<ConversationTurn>,
    /// Most recently generated program
    #[serde(default)]
    pub current_code: String,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            model: model.into(),
            turns: Vec::new(),
            current_code: String::new(),
        }
    }

    /// Append a turn to the history
    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
        self.updated_at = unix_now();
    }

    pub fn set_code(&mut self, code: impl Into<String>) {
        self.current_code = code.into();
        self.updated_at = unix_now();
    }

    /// First user prompt, used as the session title
    pub fn title(&self) -> &str {
        self.turns.first().map(|t| t.user.as_str()).unwrap_or("")
    }
}

/// Session storage manager
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `base_dir`, creating it if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Store under ~/.polyflow/sessions
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".polyflow").join("sessions"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, session: &Session) -> std::io::Result<PathBuf> {
        let path = self.session_path(&session.id)?;
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(&self, session_id: &str) -> std::io::Result<Session> {
        load_from_path(&self.session_path(session_id)?)
    }

    /// List saved sessions, newest first; unreadable files are skipped
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(session) = load_from_path(&path) {
                    sessions.push(SessionSummary {
                        title: truncate(session.title(), 50),
                        turns: session.turns.len(),
                        created_at: session.created_at,
                        id: session.id,
                    });
                }
            }
        }
        // UUID v7 ids sort by creation time
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(sessions)
    }

    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.session_path(session_id)?)
    }

    /// Ids are file stems inside `base_dir`; anything that could name
    /// another path is refused
    fn session_path(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid session id '{}'", session_id),
            ));
        }
        Ok(self.base_dir.join(format!("{}.json", session_id)))
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: u64,
    pub turns: usize,
}

fn load_from_path(path: &Path) -> std::io::Result<Session> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Truncate to `max_chars` characters, adding an ellipsis if needed
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
