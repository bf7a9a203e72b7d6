//! Shared state for comms channels.
//!
//! Channels receive an `Arc<CommsState>` and can only submit user text and
//! report lifecycle events. The dispatcher itself stays private.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::CommandDispatcher;

/// Events a channel sends back to the comms manager.
#[derive(Debug)]
pub enum CommsEvent {
    /// Channel has stopped (clean exit or EOF).
    ChannelShutdown { channel_id: String },
}

/// Shared state passed as `Arc<CommsState>` to every channel task.
pub struct CommsState {
    dispatcher: CommandDispatcher,
    event_tx: mpsc::Sender<CommsEvent>,
}

impl CommsState {
    pub fn new(dispatcher: CommandDispatcher, event_tx: mpsc::Sender<CommsEvent>) -> Self {
        Self { dispatcher, event_tx }
    }

    /// Submit `text` from `user_id` on `channel_id`.
    ///
    /// Returns the reply, or `None` when the text is not a command.
    pub async fn send_message(&self, channel_id: &str, user_id: &str, text: &str) -> Option<String> {
        debug!(%channel_id, %user_id, "dispatching channel message");
        self.dispatcher.handle(user_id, text).await
    }

    /// Report an event to the comms manager. Drops the event when the
    /// manager is gone or not keeping up.
    pub fn report_event(&self, event: CommsEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("comms event dropped: {e}");
        }
    }
}
