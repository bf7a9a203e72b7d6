//! Branch auto-selection after a reply.
//!
//! Multi-branch replies leave the conversation waiting for the user to pick
//! one. Until a branch is picked, the next message is refused with
//! `chat_choice_shown`, so the bot always confirms branch 0 right away.

use serde::Serialize;
use tracing::debug;

use crate::neko::{NekoClient, NekoError};
use crate::neko::stream::DEFAULT_BRANCH;

#[derive(Debug, Serialize)]
struct SelectChoiceRequest<'a> {
    msg_id: &'a str,
    choice_idx: u64,
}

impl NekoClient {
    /// Select branch 0 for `message_id`, bounded by the choice timeout.
    ///
    /// Any HTTP response counts as delivered; only transport errors and
    /// timeouts are reported. Callers are expected to log and move on.
    pub async fn confirm_default_branch(&self, message_id: &str) -> Result<(), NekoError> {
        let body = SelectChoiceRequest { msg_id: message_id, choice_idx: DEFAULT_BRANCH };
        let response = self
            .post_json(&self.select_choice_url(), &body, self.choice_timeout())
            .await?;
        debug!(msg_id = %message_id, status = %response.status(), "default branch confirmed");
        Ok(())
    }
}
