//! Per-user conversation and model state.
//!
//! [`SessionStore`] is the narrow interface the session manager depends on;
//! [`MemorySessionStore`] is the process-lifetime implementation. Entries are
//! never evicted.
//!
//! Each call takes the lock for a single map operation only. Two flows for
//! the same user are not serialized against each other: the last write wins
//! and an earlier conversation may be orphaned on the remote side.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::neko::NekoModel;

/// Session bookkeeping keyed by opaque user id.
pub trait SessionStore: Send + Sync {
    /// Active conversation id for `user_id`, if one was ever created.
    fn get(&self, user_id: &str) -> Option<String>;

    /// Replace the active conversation for `user_id`.
    fn put(&self, user_id: &str, conversation_id: &str);

    /// Selected model, or the store default when the user never chose one.
    fn get_model(&self, user_id: &str) -> NekoModel;

    fn set_model(&self, user_id: &str, model: NekoModel);
}

#[derive(Debug, Default)]
struct UserSession {
    conversation_id: Option<String>,
    model: Option<NekoModel>,
}

/// In-memory [`SessionStore`].
pub struct MemorySessionStore {
    default_model: NekoModel,
    /// user_id -> session
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl MemorySessionStore {
    pub fn new(default_model: NekoModel) -> Self {
        Self {
            default_model,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.with_sessions(|s| s.len())
    }

    fn with_sessions<R>(&self, f: impl FnOnce(&mut HashMap<String, UserSession>) -> R) -> R {
        let mut guard = match self.sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                // Every mutation is a single insert, so the map is still consistent.
                warn!("session store lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(NekoModel::default())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, user_id: &str) -> Option<String> {
        self.with_sessions(|s| s.get(user_id).and_then(|u| u.conversation_id.clone()))
    }

    fn put(&self, user_id: &str, conversation_id: &str) {
        self.with_sessions(|s| {
            s.entry(user_id.to_string()).or_default().conversation_id =
                Some(conversation_id.to_string());
        })
    }

    fn get_model(&self, user_id: &str) -> NekoModel {
        self.with_sessions(|s| s.get(user_id).and_then(|u| u.model))
            .unwrap_or(self.default_model)
    }

    fn set_model(&self, user_id: &str, model: NekoModel) {
        self.with_sessions(|s| {
            s.entry(user_id.to_string()).or_default().model = Some(model);
        })
    }
}
