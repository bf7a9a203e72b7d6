//! Conversation lifecycle: create conversations and apply model choices.
//!
//! The manager is the only writer of the [`SessionStore`]. Nothing here is
//! retried; a failed call leaves the store as it was and the user re-issues
//! the command.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::neko::{NekoClient, NekoError, NekoModel, SessionStore};

/// Creates and configures conversations on behalf of users.
#[derive(Clone)]
pub struct SessionManager {
    client: NekoClient,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(client: NekoClient, store: Arc<dyn SessionStore>) -> Self {
        Self { client, store }
    }

    pub fn client(&self) -> &NekoClient {
        &self.client
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Start a fresh conversation for `user_id` with their selected model.
    ///
    /// On success the new id replaces any previous one in the store, and the
    /// model is re-applied through [`switch_model`](Self::switch_model) since
    /// the creation call's `model` field does not reliably stick.
    pub async fn create_session(&self, user_id: &str) -> Result<String, NekoError> {
        let model = self.store.get_model(user_id);
        let url = self.client.chat_url();

        let response = self
            .client
            .post_json(&url, &CreateChatRequest { model }, self.client.request_timeout())
            .await
            .inspect_err(|e| warn!(%user_id, error = %e, "create conversation failed"))?;

        let body: Value = response.json().await.map_err(|e| {
            warn!(%user_id, error = %e, "create conversation returned undecodable body");
            NekoError::from(e)
        })?;

        let conversation_id = conversation_id_from(&body).ok_or_else(|| {
            warn!(%user_id, "create conversation response has no id");
            NekoError::MissingConversationId
        })?;

        self.store.put(user_id, &conversation_id);
        info!(%user_id, %conversation_id, %model, "conversation created");

        // Model re-assert is best effort: a failure only means the store keeps
        // the previous model, the conversation itself is usable.
        if !self.switch_model(user_id, &conversation_id, model).await {
            warn!(%user_id, %conversation_id, %model, "model re-assert failed after create");
        }

        Ok(conversation_id)
    }

    /// Apply `model` to `conversation_id`.
    ///
    /// Returns `true` and records the model only on HTTP 200. Transport
    /// errors and any other status yield `false` with the store unchanged.
    pub async fn switch_model(&self, user_id: &str, conversation_id: &str, model: NekoModel) -> bool {
        let url = self.client.select_model_url();
        let body = SelectModelRequest { chat_id: conversation_id, model };

        match self.client.post_json(&url, &body, self.client.request_timeout()).await {
            Ok(response) if response.status() == StatusCode::OK => {
                self.store.set_model(user_id, model);
                debug!(%user_id, %conversation_id, %model, "model selected");
                true
            }
            Ok(response) => {
                warn!(%user_id, %conversation_id, status = %response.status(), "select model rejected");
                false
            }
            Err(e) => {
                warn!(%user_id, %conversation_id, error = %e, "select model failed");
                false
            }
        }
    }

    /// Stored conversation for `user_id`, creating one when absent.
    pub async fn ensure_session(&self, user_id: &str) -> Result<String, NekoError> {
        match self.store.get(user_id) {
            Some(id) => Ok(id),
            None => {
                debug!(%user_id, "no conversation yet, creating one");
                self.create_session(user_id).await
            }
        }
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateChatRequest {
    model: NekoModel,
}

#[derive(Debug, Serialize)]
struct SelectModelRequest<'a> {
    chat_id: &'a str,
    model: NekoModel,
}

/// Pull the new conversation id out of a create response.
///
/// The service has been seen to answer with either `chat_id` or `id`; both
/// are accepted, `chat_id` first. Empty strings count as absent.
fn conversation_id_from(body: &Value) -> Option<String> {
    ["chat_id", "id"].iter().find_map(|key| match body.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
