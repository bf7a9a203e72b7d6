//! Neko conversational service integration.
//!
//! ```text
//! SessionManager ──► NekoClient ──► reqwest
//!      │                 │
//!      ▼                 ├── stream_reply()          (stream.rs)
//! SessionStore           └── confirm_default_branch() (branch.rs)
//! ```
//!
//! All wire types are private to the submodules; callers only see
//! conversation ids, [`NekoModel`], and reply strings.

pub mod branch;
pub mod client;
pub mod manager;
pub mod session;
pub mod stream;

pub use client::NekoClient;
pub use manager::SessionManager;
pub use session::{MemorySessionStore, SessionStore};
pub use stream::{ReplyAssembler, StreamEvent, StreamOutcome};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NekoError {
    #[error("neko request failed: {0}")]
    Request(String),
    #[error("neko request timed out")]
    Timeout,
    #[error("neko returned HTTP {0}")]
    Status(u16),
    #[error("failed to decode neko response: {0}")]
    Decode(String),
    #[error("neko response carried no conversation id")]
    MissingConversationId,
}

impl From<reqwest::Error> for NekoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NekoError::Timeout
        } else if e.is_decode() {
            NekoError::Decode(e.to_string())
        } else {
            NekoError::Request(e.to_string())
        }
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Persona models offered by the service.
///
/// Serialized with the exact names the API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NekoModel {
    #[default]
    #[serde(rename = "Orange Cat")]
    OrangeCat,
    #[serde(rename = "Exotic Shorthair")]
    ExoticShorthair,
}

impl NekoModel {
    /// Name sent in request bodies.
    pub fn wire_name(self) -> &'static str {
        match self {
            NekoModel::OrangeCat => "Orange Cat",
            NekoModel::ExoticShorthair => "Exotic Shorthair",
        }
    }

    /// Name shown to users in replies.
    pub fn display_name(self) -> &'static str {
        match self {
            NekoModel::OrangeCat => "橘猫",
            NekoModel::ExoticShorthair => "黑猫",
        }
    }

    /// Match a free-text `switch` argument against the model aliases.
    ///
    /// Substring match, ASCII aliases case-insensitive. Orange Cat is checked
    /// first when both aliases appear.
    pub fn from_alias(arg: &str) -> Option<Self> {
        let lower = arg.to_lowercase();
        if arg.contains("橘猫") || lower.contains("orange") {
            Some(NekoModel::OrangeCat)
        } else if arg.contains("黑猫") || lower.contains("exotic") {
            Some(NekoModel::ExoticShorthair)
        } else {
            None
        }
    }
}

impl std::fmt::Display for NekoModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}
