//! Inbound call bridge
//!
//! Trampoline calls arrive on arbitrary native threads and are forwarded to
//! the controller over the data channel. The protocol has no call ids, so
//! one global lock keeps at most one round trip on the wire at a time.

use hands_common::message::{RemoteCallRequest, RemoteCallResponse};
use hands_common::{Error, Message, MessageChannel, MessageType, Result};
use hands_core::ChannelStream;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// One connected data-channel peer.
pub struct DataSession {
    channel: Mutex<MessageChannel<Box<dyn ChannelStream>>>,
    failed: AtomicBool,
}

impl DataSession {
    pub fn new(channel: MessageChannel<Box<dyn ChannelStream>>) -> Self {
        Self {
            channel: Mutex::new(channel),
            failed: AtomicBool::new(false),
        }
    }

    /// Send a `RemoteCall` and wait for its `RemoteCallResponse`.
    pub fn round_trip(&self, request: RemoteCallRequest) -> Result<RemoteCallResponse> {
        let mut channel = self.channel.lock();
        match channel.round_trip(
            &Message::RemoteCall(request),
            MessageType::RemoteCallResponse,
        )? {
            Message::RemoteCallResponse(response) => Ok(response),
            other => Err(Error::UnexpectedMessage {
                expected: MessageType::RemoteCallResponse,
                actual: other.message_type(),
            }),
        }
    }

    /// A round trip failed; the stream position is no longer trustworthy.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

/// Routes trampoline invocations to the active data session.
#[derive(Default)]
pub struct InboundBridge {
    call_lock: Mutex<()>,
    // Non-owning: the data service owns the session and its lifetime.
    active: RwLock<Option<Weak<DataSession>>>,
}

impl InboundBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, session: &Arc<DataSession>) {
        *self.active.write() = Some(Arc::downgrade(session));
        debug!(target: "hands_agent::bridge", "Data session attached");
    }

    pub fn detach(&self) {
        if self.active.write().take().is_some() {
            debug!(target: "hands_agent::bridge", "Data session detached");
        }
    }

    /// Detach only if `session` is still the active one.
    pub fn detach_session(&self, session: &Arc<DataSession>) {
        let mut active = self.active.write();
        let is_current = active
            .as_ref()
            .map(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(session)))
            .unwrap_or(false);
        if is_current {
            *active = None;
            debug!(target: "hands_agent::bridge", "Failed data session detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<DataSession>> {
        self.active.read().as_ref().and_then(Weak::upgrade)
    }

    /// Forward a call to the controller and return its answer.
    ///
    /// Returns 0 without blocking on the channel when no controller is
    /// attached. Any failure detaches the session and also returns 0.
    pub fn forward(&self, name: &str, args: &[usize]) -> usize {
        let _serial = self.call_lock.lock();

        let session = match self.current() {
            Some(session) => session,
            None => {
                debug!(target: "hands_agent::bridge", function = name, "No controller attached, returning 0");
                return 0;
            }
        };

        let request = RemoteCallRequest {
            name: name.to_string(),
            arguments: args.iter().map(|arg| *arg as u64).collect(),
        };

        match session.round_trip(request) {
            Ok(response) => {
                if response.wants_stack_trace() {
                    let trace = backtrace::Backtrace::new();
                    info!(target: "hands_agent::bridge", function = name, "Stack trace requested by controller:\n{:?}", trace);
                }
                debug!(target: "hands_agent::bridge", function = name, return_value = response.return_value, "Remote call completed");
                response.return_value as usize
            }
            Err(e) => {
                warn!(target: "hands_agent::bridge", function = name, error = %e, "Remote call failed, detaching data session");
                session.mark_failed();
                self.detach_session(&session);
                0
            }
        }
    }
}
