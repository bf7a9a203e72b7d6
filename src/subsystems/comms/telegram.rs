//! Telegram comms channel — receives commands via the Telegram Bot API and
//! replies in the same chat.
//!
//! The sender's Telegram user id is the session key, so each user keeps one
//! conversation across private chats and groups. Non-command messages are
//! ignored.

use std::env;
use std::sync::Arc;

use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::subsystems::runtime::{Component, ComponentFuture};
use super::state::CommsState;

/// Telegram caps messages at 4096 characters; chunk below that.
const MAX_MESSAGE_LENGTH: usize = 4000;

pub struct TelegramChannel {
    channel_id: String,
    state: Arc<CommsState>,
}

impl TelegramChannel {
    pub fn new(channel_id: impl Into<String>, state: Arc<CommsState>) -> Self {
        Self { channel_id: channel_id.into(), state }
    }
}

impl Component for TelegramChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(run_telegram(self.channel_id, self.state, shutdown))
    }
}

/// Split `text` into Telegram-sized pieces on char boundaries.
fn chunk_reply(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec!["(empty response)".to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(MAX_MESSAGE_LENGTH)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

async fn run_telegram(
    channel_id: String,
    state: Arc<CommsState>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let token = match env::var("TELEGRAM_BOT_TOKEN") {
        Ok(t) => t,
        Err(_) => {
            warn!(%channel_id, "TELEGRAM_BOT_TOKEN not set, telegram channel exiting");
            return Ok(());
        }
    };

    info!(%channel_id, "telegram channel starting");

    let bot = Bot::new(token);

    let handler_state = state.clone();
    let handler_channel_id = channel_id.clone();

    let handler = Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
        let state = handler_state.clone();
        let channel_id = handler_channel_id.clone();
        async move {
            let (Some(text), Some(user)) = (msg.text(), msg.from.as_ref()) else {
                return respond(());
            };
            let user_id = user.id.0.to_string();
            debug!(%channel_id, %user_id, "telegram received message");

            let Some(reply) = state.send_message(&channel_id, &user_id, text).await else {
                return respond(());
            };

            for chunk in chunk_reply(&reply) {
                if let Err(e) = bot.send_message(msg.chat.id, chunk).await {
                    warn!("failed to send telegram reply: {e}");
                }
            }
            respond(())
        }
    });

    let mut dispatcher = Dispatcher::builder(bot, handler).build();

    tokio::select! {
        biased;

        _ = shutdown.cancelled() => {
            info!(%channel_id, "shutdown signal received, closing telegram channel");
        }
        _ = dispatcher.dispatch() => {
            warn!(%channel_id, "telegram dispatcher exited unexpectedly");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reply_gets_placeholder() {
        assert_eq!(chunk_reply(""), vec!["(empty response)".to_string()]);
    }

    #[test]
    fn long_reply_splits_on_char_boundaries() {
        let text = "喵".repeat(MAX_MESSAGE_LENGTH + 10);
        let chunks = chunk_reply(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), MAX_MESSAGE_LENGTH);
        assert_eq!(chunks[1].chars().count(), 10);
    }
}
