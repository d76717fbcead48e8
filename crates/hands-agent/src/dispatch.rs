//! Command request dispatcher
//!
//! Every request gets exactly one reply. Engine failures become failed
//! replies here; nothing below this point reaches the service loop.

use crate::console;
use crate::context::AgentContext;
use hands_common::message::StatusWithValueResponse;
use hands_common::Message;
use hands_core::call_function;
use tracing::{debug, warn};

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub response: Option<Message>,
    /// False ends the session after the response is sent.
    pub keep_open: bool,
}

impl Handled {
    fn reply(response: Message) -> Self {
        Self {
            response: Some(response),
            keep_open: true,
        }
    }

    fn ignored() -> Self {
        Self {
            response: None,
            keep_open: true,
        }
    }
}

pub fn handle(ctx: &AgentContext, message: Message) -> Handled {
    match message {
        Message::CloseProcess(_) => {
            debug!(target: "hands_agent::dispatch", "Close requested, ending session");
            Handled {
                response: Some(Message::status(true)),
                keep_open: false,
            }
        }

        Message::IsValid(_) => Handled::reply(Message::status(true)),

        Message::ReadMemory(request) => {
            let budget = StatusWithValueResponse::max_value_len(ctx.config.channel.max_message_size);
            if request.size as usize > budget {
                warn!(target: "hands_agent::dispatch", address = format!("{:#x}", request.address), size = request.size, max = budget, "ReadMemory reply would exceed the message size limit");
                return Handled::reply(Message::status_with_value(false, Vec::new()));
            }

            let response = match ctx
                .memory
                .read(request.address as usize, request.size as usize)
            {
                Ok(bytes) => Message::status_with_value(true, bytes),
                Err(e) => {
                    debug!(target: "hands_agent::dispatch", address = format!("{:#x}", request.address), size = request.size, error = %e, "ReadMemory failed");
                    Message::status_with_value(false, Vec::new())
                }
            };
            Handled::reply(response)
        }

        Message::WriteMemory(request) => {
            let result = ctx.memory.write(request.address as usize, &request.data);
            if let Err(e) = &result {
                debug!(target: "hands_agent::dispatch", address = format!("{:#x}", request.address), size = request.data.len(), error = %e, "WriteMemory failed");
            }
            Handled::reply(Message::status(result.is_ok()))
        }

        Message::AllocateMemory(request) => {
            let response = match ctx.memory.allocate(
                request.size as usize,
                request.allocation_type,
                request.protect,
            ) {
                Ok(address) => Message::pointer_value(address as u64),
                Err(e) => {
                    debug!(target: "hands_agent::dispatch", size = request.size, error = %e, "AllocateMemory failed");
                    Message::status_with_value(false, Vec::new())
                }
            };
            Handled::reply(response)
        }

        Message::FreeMemory(request) => {
            let result = ctx.memory.free(request.address as usize);
            if let Err(e) = &result {
                debug!(target: "hands_agent::dispatch", address = format!("{:#x}", request.address), error = %e, "FreeMemory failed");
            }
            Handled::reply(Message::status(result.is_ok()))
        }

        Message::QueryMemory(request) => {
            let protect = ctx.memory.query(request.address as usize);
            let response = if protect == 0 {
                Message::status_with_value(false, Vec::new())
            } else {
                Message::status_with_value(true, protect.to_le_bytes().to_vec())
            };
            Handled::reply(response)
        }

        Message::ProtectMemory(request) => {
            let result = ctx.memory.protect(
                request.address as usize,
                request.size as usize,
                request.protect,
            );
            if let Err(e) = &result {
                debug!(target: "hands_agent::dispatch", address = format!("{:#x}", request.address), error = %e, "ProtectMemory failed");
            }
            Handled::reply(Message::status(result.is_ok()))
        }

        Message::CallFunction(request) => {
            let response = match call_function(request.address as usize, &request.arguments) {
                Ok(value) => Message::pointer_value(value as u64),
                Err(e) => Message::failure_text(e.to_string()),
            };
            Handled::reply(response)
        }

        Message::AllocateConsole(_) => Handled::reply(Message::status(console::allocate())),

        Message::CreateFunction(request) => {
            let response = match ctx
                .functions
                .create(&request.name, request.arg_count as usize)
            {
                Ok(0) => Message::failure_text("Trampoline has no code address"),
                Ok(address) => Message::pointer_value(address as u64),
                Err(e) => {
                    warn!(target: "hands_agent::dispatch", function = %request.name, error = %e, "CreateFunction failed");
                    Message::failure_text(e.to_string())
                }
            };
            Handled::reply(response)
        }

        Message::FreeFunction(request) => {
            Handled::reply(Message::status(ctx.functions.free(&request.name)))
        }

        // A RemoteCall only travels agent to controller. Answer with the
        // same zero result an unattached trampoline produces.
        Message::RemoteCall(request) => {
            warn!(target: "hands_agent::dispatch", function = %request.name, "RemoteCall received on command channel");
            Handled::reply(Message::RemoteCallResponse(Default::default()))
        }

        message @ (Message::Status(_)
        | Message::StatusWithValue(_)
        | Message::RemoteCallResponse(_)) => {
            warn!(target: "hands_agent::dispatch", message_type = ?message.message_type(), "Ignoring response-only message");
            Handled::ignored()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hands_common::memory::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    use hands_common::message::*;
    use hands_common::AgentConfig;

    fn context() -> AgentContext {
        AgentContext::new(AgentConfig::default())
    }

    fn reply(ctx: &AgentContext, message: Message) -> Message {
        let handled = handle(ctx, message);
        assert!(handled.keep_open);
        handled.response.unwrap()
    }

    fn pointer(message: &Message) -> u64 {
        match message {
            Message::StatusWithValue(StatusWithValueResponse {
                success: true,
                value,
            }) => u64::from_le_bytes(value.as_slice().try_into().unwrap()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    extern "C" fn add(a: usize, b: usize) -> usize {
        a + b
    }

    #[test]
    fn test_close_process_ends_session() {
        let handled = handle(&context(), Message::CloseProcess(CloseProcessRequest));
        assert_eq!(handled.response, Some(Message::status(true)));
        assert!(!handled.keep_open);
    }

    #[test]
    fn test_is_valid() {
        assert_eq!(
            reply(&context(), Message::IsValid(IsValidRequest)),
            Message::status(true)
        );
    }

    #[test]
    fn test_read_live_memory() {
        let ctx = context();
        let data = *b"0123456789abcdef";
        let response = reply(
            &ctx,
            Message::ReadMemory(ReadMemoryRequest {
                address: data.as_ptr() as u64,
                size: 16,
            }),
        );
        assert_eq!(response, Message::status_with_value(true, data.to_vec()));
    }

    #[test]
    fn test_read_larger_than_message_limit_fails() {
        let mut config = AgentConfig::default();
        config.channel.max_message_size = 1024;
        let ctx = AgentContext::new(config);
        let data = vec![0xabu8; 2048];

        let read = |size: u32| {
            reply(
                &ctx,
                Message::ReadMemory(ReadMemoryRequest {
                    address: data.as_ptr() as u64,
                    size,
                }),
            )
        };
        assert_eq!(read(2048), Message::status_with_value(false, Vec::new()));

        let fits = StatusWithValueResponse::max_value_len(1024);
        assert_eq!(
            read(fits as u32),
            Message::status_with_value(true, data[..fits].to_vec())
        );
        assert!(read(fits as u32).encode().unwrap().len() <= 1024);
    }

    #[test]
    fn test_create_function_with_too_many_arguments_fails() {
        let response = reply(
            &context(),
            Message::CreateFunction(CreateFunctionRequest {
                name: "wide".into(),
                arg_count: u32::MAX,
            }),
        );
        match response {
            Message::StatusWithValue(StatusWithValueResponse {
                success: false,
                value,
            }) => assert!(!value.is_empty()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_call_with_too_many_arguments_reports_text() {
        let response = reply(
            &context(),
            Message::CallFunction(CallFunctionRequest {
                address: add as usize as u64,
                arguments: vec![1; hands_core::MAX_ARITY + 1],
            }),
        );
        assert!(matches!(
            response,
            Message::StatusWithValue(StatusWithValueResponse { success: false, .. })
        ));
    }

    #[test]
    fn test_write_to_unmapped_address_fails() {
        let response = reply(
            &context(),
            Message::WriteMemory(WriteMemoryRequest {
                address: 0,
                data: vec![1, 2, 3],
            }),
        );
        assert_eq!(response, Message::status(false));
    }

    #[cfg(any(windows, target_os = "linux", target_os = "android"))]
    #[test]
    fn test_allocate_query_free() {
        let ctx = context();
        let allocated = reply(
            &ctx,
            Message::AllocateMemory(AllocateMemoryRequest {
                size: 4096,
                allocation_type: MEM_COMMIT | MEM_RESERVE,
                protect: PAGE_READWRITE,
            }),
        );
        let address = pointer(&allocated);
        assert_ne!(address, 0);

        assert_eq!(
            reply(&ctx, Message::QueryMemory(QueryMemoryRequest { address })),
            Message::status_with_value(true, PAGE_READWRITE.to_le_bytes().to_vec())
        );
        assert_eq!(
            reply(&ctx, Message::FreeMemory(FreeMemoryRequest { address })),
            Message::status(true)
        );
        assert_eq!(
            reply(&ctx, Message::FreeMemory(FreeMemoryRequest { address })),
            Message::status(false)
        );
    }

    #[test]
    fn test_failed_allocation_has_empty_value() {
        let response = reply(
            &context(),
            Message::AllocateMemory(AllocateMemoryRequest {
                size: 0,
                allocation_type: MEM_COMMIT,
                protect: PAGE_READWRITE,
            }),
        );
        assert_eq!(response, Message::status_with_value(false, Vec::new()));
    }

    #[test]
    fn test_call_function() {
        let response = reply(
            &context(),
            Message::CallFunction(CallFunctionRequest {
                address: add as usize as u64,
                arguments: vec![20, 22],
            }),
        );
        assert_eq!(pointer(&response), 42);
    }

    #[test]
    fn test_call_null_function_reports_text() {
        let response = reply(
            &context(),
            Message::CallFunction(CallFunctionRequest {
                address: 0,
                arguments: vec![],
            }),
        );
        match response {
            Message::StatusWithValue(StatusWithValueResponse {
                success: false,
                value,
            }) => assert!(!value.is_empty()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_create_and_free_function() {
        let ctx = context();
        let create = || {
            reply(
                &ctx,
                Message::CreateFunction(CreateFunctionRequest {
                    name: "f".into(),
                    arg_count: 2,
                }),
            )
        };
        let first = pointer(&create());
        assert_eq!(pointer(&create()), first);

        let free = Message::FreeFunction(FreeFunctionRequest { name: "f".into() });
        assert_eq!(reply(&ctx, free.clone()), Message::status(true));
        assert_eq!(reply(&ctx, free), Message::status(false));
        assert_ne!(pointer(&create()), 0);
    }

    #[test]
    fn test_response_messages_are_ignored() {
        let ctx = context();
        for message in [
            Message::status(true),
            Message::status_with_value(false, vec![1]),
            Message::RemoteCallResponse(RemoteCallResponse::default()),
        ] {
            assert_eq!(handle(&ctx, message), Handled::ignored());
        }
    }
}
