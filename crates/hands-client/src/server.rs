//! Answers `RemoteCall`s arriving on the agent's data channel

use hands_common::message::{RemoteCallResponse, FLAG_PRINT_STACK};
use hands_common::{Error, Message, MessageChannel, Result};
use hands_core::{connect, ChannelName, LocalStream};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// What a registered function returns to the trampoline's caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallResponse {
    pub return_value: u64,
    /// Ask the agent to log a stack trace of the calling thread.
    pub print_stack: bool,
}

impl CallResponse {
    pub fn value(return_value: u64) -> Self {
        Self {
            return_value,
            print_stack: false,
        }
    }

    pub fn with_stack_trace(mut self) -> Self {
        self.print_stack = true;
        self
    }
}

impl From<CallResponse> for RemoteCallResponse {
    fn from(response: CallResponse) -> Self {
        RemoteCallResponse {
            return_value: response.return_value,
            flags: if response.print_stack {
                FLAG_PRINT_STACK
            } else {
                0
            },
        }
    }
}

type Handler = Arc<dyn Fn(&[u64]) -> CallResponse + Send + Sync>;
type Handlers = Arc<RwLock<HashMap<String, Handler>>>;

/// Background responder on the data channel.
pub struct FunctionServer {
    handlers: Handlers,
    stream: LocalStream,
    thread: Option<JoinHandle<()>>,
}

impl FunctionServer {
    pub fn connect(name: &ChannelName) -> Result<Self> {
        let stream = connect(name)?;
        let reader = stream.try_clone()?;
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));

        let thread = {
            let handlers = handlers.clone();
            thread::Builder::new()
                .name("hands-function-server".into())
                .spawn(move || serve(MessageChannel::new(reader), handlers))?
        };
        info!(target: "hands_client::server", channel = %name, "Function server connected");

        Ok(Self {
            handlers,
            stream,
            thread: Some(thread),
        })
    }

    /// Answer calls to `name` with `handler`. Replaces an earlier handler.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[u64]) -> CallResponse + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Disconnect and wait for the responder thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "hands_client::server", "Function server thread panicked");
            }
        }
    }
}

impl Drop for FunctionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut channel: MessageChannel<LocalStream>, handlers: Handlers) {
    loop {
        let message = match channel.receive() {
            Ok(message) => message,
            Err(Error::ChannelIo(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(target: "hands_client::server", "Data channel closed");
                return;
            }
            Err(e) => {
                warn!(target: "hands_client::server", error = %e, "Data channel failed");
                return;
            }
        };

        let response = match message {
            Message::RemoteCall(call) => answer(&handlers, &call.name, &call.arguments),
            other => {
                warn!(target: "hands_client::server", message_type = ?other.message_type(), "Unexpected message on data channel");
                continue;
            }
        };

        if let Err(e) = channel.send(&Message::RemoteCallResponse(response)) {
            warn!(target: "hands_client::server", error = %e, "Failed to send call response");
            return;
        }
    }
}

fn answer(handlers: &Handlers, name: &str, arguments: &[u64]) -> RemoteCallResponse {
    let handler = handlers.read().get(name).cloned();
    let Some(handler) = handler else {
        warn!(target: "hands_client::server", function = name, "No handler registered");
        return RemoteCallResponse::default();
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
        Ok(response) => response.into(),
        Err(_) => {
            warn!(target: "hands_client::server", function = name, "Handler panicked");
            RemoteCallResponse::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_response_flags() {
        let plain: RemoteCallResponse = CallResponse::value(5).into();
        assert_eq!(plain.return_value, 5);
        assert!(!plain.wants_stack_trace());

        let traced: RemoteCallResponse = CallResponse::value(1).with_stack_trace().into();
        assert!(traced.wants_stack_trace());
    }

    #[test]
    fn test_answer_dispatches_by_name() {
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        handlers.write().insert(
            "sum".into(),
            Arc::new(|args: &[u64]| CallResponse::value(args.iter().sum())),
        );
        handlers
            .write()
            .insert("boom".into(), Arc::new(|_: &[u64]| -> CallResponse { panic!("handler failure") }));

        assert_eq!(answer(&handlers, "sum", &[1, 2, 3]).return_value, 6);
        assert_eq!(answer(&handlers, "missing", &[1]), RemoteCallResponse::default());
        assert_eq!(answer(&handlers, "boom", &[]), RemoteCallResponse::default());
    }
}
