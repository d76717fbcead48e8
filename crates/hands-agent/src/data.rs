//! Data service
//!
//! Accepts the controller's data connection and attaches it to the inbound
//! bridge. The connection itself is driven by trampoline threads; this
//! service only watches for it going away.

use crate::bridge::DataSession;
use crate::context::AgentContext;
use hands_common::{ChannelState, MessageChannel};
use hands_core::{Channel, ChannelStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub fn run<C: Channel>(ctx: &AgentContext, channel: &C, shutdown: &AtomicBool) {
    info!(target: "hands_agent::data", channel = %channel.name(), "Data service started");
    let probe_interval = ctx.config.channel.probe_interval();

    while !shutdown.load(Ordering::Acquire) {
        let stream = match channel.wait_for_connection() {
            Ok(stream) => stream,
            Err(e) => {
                if shutdown.load(Ordering::Acquire) || channel.state() == ChannelState::Closed {
                    break;
                }
                error!(target: "hands_agent::data", error = %e, "Accept failed");
                thread::sleep(probe_interval);
                continue;
            }
        };

        if shutdown.load(Ordering::Acquire) {
            let _ = channel.disconnect();
            break;
        }

        let timeout = ctx.config.bridge.remote_call_timeout();
        if let Err(e) = stream.set_read_timeout(timeout) {
            warn!(target: "hands_agent::data", error = %e, "Failed to set remote call timeout");
        }

        let stream: Box<dyn ChannelStream> = Box::new(stream);
        let session = Arc::new(DataSession::new(MessageChannel::with_max_message_size(
            stream,
            ctx.config.channel.max_message_size,
        )));
        ctx.bridge.attach(&session);
        info!(target: "hands_agent::data", "Controller attached to data channel");

        while !shutdown.load(Ordering::Acquire) && !session.is_failed() && channel.is_connected() {
            thread::sleep(probe_interval);
        }

        ctx.bridge.detach_session(&session);
        if session.is_failed() {
            channel.mark_broken();
        }
        if let Err(e) = channel.disconnect() {
            debug!(target: "hands_agent::data", error = %e, "Channel already disconnected");
        }
        info!(target: "hands_agent::data", "Controller detached from data channel");
    }

    info!(target: "hands_agent::data", "Data service stopped");
}
