//! Comms subsystem — manages the external I/O channels.
//!
//! Each channel (PTY, Telegram) implements [`Component`] and captures an
//! `Arc<CommsState>` at construction. [`start`] spawns the configured
//! channels through [`spawn_components`] and drains their lifecycle events
//! in a small background task.

mod state;
#[cfg(feature = "channel-pty")]
pub mod pty;
#[cfg(feature = "channel-telegram")]
pub mod telegram;

pub use state::{CommsEvent, CommsState};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::CommandDispatcher;
use crate::config::Config;
use crate::subsystems::runtime::{Component, SubsystemHandle, spawn_components};

/// Spawn all configured channels and return a [`SubsystemHandle`].
///
/// Synchronous: returns as soon as the tasks are spawned.
pub fn start(
    config: &Config,
    dispatcher: CommandDispatcher,
    shutdown: CancellationToken,
) -> SubsystemHandle {
    let (event_tx, event_rx) = mpsc::channel::<CommsEvent>(32);
    let state = Arc::new(CommsState::new(dispatcher, event_tx));

    let mut components: Vec<Box<dyn Component>> = Vec::new();

    #[cfg(feature = "channel-pty")]
    {
        if config.comms_pty_should_load() {
            info!("loading pty channel");
            components.push(Box::new(pty::PtyChannel::new("pty0", state.clone())));
        }
    }

    #[cfg(feature = "channel-telegram")]
    {
        if config.comms_telegram_should_load() {
            info!("loading telegram channel");
            components.push(Box::new(telegram::TelegramChannel::new("telegram0", state.clone())));
        }
    }

    #[cfg(not(feature = "channel-telegram"))]
    {
        if config.comms_telegram_should_load() {
            warn!("telegram enabled in config but built without the channel-telegram feature");
        }
    }

    if components.is_empty() {
        info!("no comms channels configured");
    }

    // Monitoring only; ends when every channel has dropped its sender.
    drop(state);
    tokio::spawn(async move {
        let mut rx = event_rx;
        while let Some(event) = rx.recv().await {
            match event {
                CommsEvent::ChannelShutdown { ref channel_id } => {
                    debug!(channel_id, "channel reported shutdown");
                }
            }
        }
    });

    spawn_components(components, shutdown)
}
