//! PTY (console) comms channel — reads commands from stdin and prints the
//! replies to stdout.
//!
//! Every console line is attributed to one local user. Lines that are not
//! commands get a usage hint. Runs until the `shutdown` token is cancelled
//! (Ctrl-C) or stdin is closed.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::HELP_REPLY;
use crate::error::AppError;
use crate::subsystems::runtime::{Component, ComponentFuture};
use super::state::{CommsEvent, CommsState};

/// User id every console message is attributed to.
pub const PTY_USER_ID: &str = "console";

pub struct PtyChannel {
    channel_id: String,
    state: Arc<CommsState>,
}

impl PtyChannel {
    pub fn new(channel_id: impl Into<String>, state: Arc<CommsState>) -> Self {
        Self { channel_id: channel_id.into(), state }
    }
}

impl Component for PtyChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(run_pty(self.channel_id, self.state, shutdown))
    }
}

async fn run_pty(
    channel_id: String,
    state: Arc<CommsState>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    info!(%channel_id, "pty channel started");
    println!("─────────────────────────────────");
    println!(" Neko console  (Ctrl-C to quit)");
    println!(" {HELP_REPLY}");
    println!("─────────────────────────────────");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("> ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                println!();
                info!(%channel_id, "pty channel shutting down");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Err(e) => {
                        warn!("pty read error: {e}");
                        break;
                    }
                    Ok(None) => {
                        info!("pty stdin closed");
                        break;
                    }
                    Ok(Some(input)) => {
                        let input = input.trim();
                        if input.is_empty() { continue; }

                        debug!(%input, "pty received line");

                        let reply = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            reply = state.send_message(&channel_id, PTY_USER_ID, input) => reply,
                        };
                        println!("{}", reply.as_deref().unwrap_or(HELP_REPLY));
                    }
                }
            }
        }
    }

    state.report_event(CommsEvent::ChannelShutdown { channel_id });
    Ok(())
}
