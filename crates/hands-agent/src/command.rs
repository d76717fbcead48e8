//! Command service
//!
//! Accepts one controller at a time on the command channel and answers its
//! requests until it closes the session, the connection fails, or the agent
//! shuts down. The channel is reused for the next controller.

use crate::context::AgentContext;
use crate::dispatch;
use hands_common::{ChannelState, Error, MessageChannel, Result};
use hands_core::{Channel, ChannelStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

pub fn run<C: Channel>(ctx: &AgentContext, channel: &C, shutdown: &AtomicBool) {
    info!(target: "hands_agent::command", channel = %channel.name(), "Command service started");

    while !shutdown.load(Ordering::Acquire) {
        let stream = match channel.wait_for_connection() {
            Ok(stream) => stream,
            Err(e) => {
                if shutdown.load(Ordering::Acquire) || channel.state() == ChannelState::Closed {
                    break;
                }
                error!(target: "hands_agent::command", error = %e, "Accept failed");
                thread::sleep(ctx.config.channel.probe_interval());
                continue;
            }
        };

        if shutdown.load(Ordering::Acquire) {
            let _ = channel.disconnect();
            break;
        }
        info!(target: "hands_agent::command", "Controller connected");

        let mut messages =
            MessageChannel::with_max_message_size(stream, ctx.config.channel.max_message_size);
        match serve(ctx, &mut messages) {
            Ok(()) => info!(target: "hands_agent::command", "Session closed by controller"),
            Err(Error::ChannelIo(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!(target: "hands_agent::command", "Controller disconnected")
            }
            Err(e) if e.is_session_fatal() => {
                channel.mark_broken();
                warn!(target: "hands_agent::command", error = %e, "Session aborted");
            }
            Err(e) => {
                channel.mark_broken();
                error!(target: "hands_agent::command", error = %e, "Session failed");
            }
        }

        if let Err(e) = channel.disconnect() {
            debug!(target: "hands_agent::command", error = %e, "Channel already disconnected");
        }
    }

    info!(target: "hands_agent::command", "Command service stopped");
}

/// Request/response loop for one controller session.
fn serve<S: ChannelStream>(ctx: &AgentContext, messages: &mut MessageChannel<S>) -> Result<()> {
    loop {
        let request = messages.receive()?;
        let message_type = request.message_type();
        debug!(target: "hands_agent::command", message_type = ?message_type, "Request received");

        let handled = dispatch::handle(ctx, request);
        if let Some(response) = &handled.response {
            messages.send(response)?;
        }
        if !handled.keep_open {
            return Ok(());
        }
    }
}
