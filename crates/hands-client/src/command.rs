//! Typed client for the agent's command channel

use hands_common::message::*;
use hands_common::{Error, Message, MessageChannel, MessageType, Result};
use hands_core::{connect, ChannelName, LocalStream};
use tracing::debug;

/// One controller session on a command channel.
pub struct CommandClient {
    channel: MessageChannel<LocalStream>,
}

impl CommandClient {
    pub fn connect(name: &ChannelName) -> Result<Self> {
        let stream = connect(name)?;
        debug!(target: "hands_client::command", channel = %name, "Connected to command channel");
        Ok(Self {
            channel: MessageChannel::new(stream),
        })
    }

    /// Send any message and return the reply as-is.
    pub fn request(&mut self, message: &Message) -> Result<Message> {
        self.channel.send(message)?;
        self.channel.receive()
    }

    pub fn is_valid(&mut self) -> Result<bool> {
        self.status(Message::IsValid(IsValidRequest))
    }

    /// End the session. The agent keeps running and accepts a new one.
    pub fn close_process(&mut self) -> Result<bool> {
        self.status(Message::CloseProcess(CloseProcessRequest))
    }

    /// `None` when the agent rejected the range.
    pub fn read_memory(&mut self, address: u64, size: u32) -> Result<Option<Vec<u8>>> {
        let (success, value) =
            self.status_with_value(Message::ReadMemory(ReadMemoryRequest { address, size }))?;
        Ok(success.then_some(value))
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<bool> {
        self.status(Message::WriteMemory(WriteMemoryRequest {
            address,
            data: data.to_vec(),
        }))
    }

    pub fn allocate_memory(
        &mut self,
        size: u32,
        allocation_type: u32,
        protect: u32,
    ) -> Result<Option<u64>> {
        let (success, value) = self.status_with_value(Message::AllocateMemory(
            AllocateMemoryRequest {
                size,
                allocation_type,
                protect,
            },
        ))?;
        if success {
            Ok(Some(decode_pointer(&value)?))
        } else {
            Ok(None)
        }
    }

    pub fn free_memory(&mut self, address: u64) -> Result<bool> {
        self.status(Message::FreeMemory(FreeMemoryRequest { address }))
    }

    /// Protection flags at `address`, `None` if it is not mapped.
    pub fn query_memory(&mut self, address: u64) -> Result<Option<u32>> {
        let (success, value) =
            self.status_with_value(Message::QueryMemory(QueryMemoryRequest { address }))?;
        if !success {
            return Ok(None);
        }
        let bytes: [u8; 4] = value.as_slice().try_into().map_err(|_| {
            Error::Protocol(format!("Expected 4-byte protection, got {} bytes", value.len()))
        })?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    pub fn protect_memory(&mut self, address: u64, size: u32, protect: u32) -> Result<bool> {
        self.status(Message::ProtectMemory(ProtectMemoryRequest {
            address,
            size,
            protect,
        }))
    }

    /// Call a function in the agent's process. Agent-side failures come back
    /// as [`Error::NativeCall`] carrying the agent's error text.
    pub fn call_function(&mut self, address: u64, arguments: &[u64]) -> Result<u64> {
        self.pointer_or_text(Message::CallFunction(CallFunctionRequest {
            address,
            arguments: arguments.to_vec(),
        }))
    }

    pub fn allocate_console(&mut self) -> Result<bool> {
        self.status(Message::AllocateConsole(AllocateConsoleRequest))
    }

    /// Address of a native function that forwards to the data channel as
    /// `name`.
    pub fn create_function(&mut self, name: &str, arg_count: u32) -> Result<u64> {
        self.pointer_or_text(Message::CreateFunction(CreateFunctionRequest {
            name: name.to_string(),
            arg_count,
        }))
    }

    pub fn free_function(&mut self, name: &str) -> Result<bool> {
        self.status(Message::FreeFunction(FreeFunctionRequest {
            name: name.to_string(),
        }))
    }

    fn status(&mut self, request: Message) -> Result<bool> {
        match self.request(&request)? {
            Message::Status(StatusResponse { success }) => Ok(success),
            other => Err(Error::UnexpectedMessage {
                expected: MessageType::Status,
                actual: other.message_type(),
            }),
        }
    }

    fn status_with_value(&mut self, request: Message) -> Result<(bool, Vec<u8>)> {
        match self.request(&request)? {
            Message::StatusWithValue(StatusWithValueResponse { success, value }) => {
                Ok((success, value))
            }
            other => Err(Error::UnexpectedMessage {
                expected: MessageType::StatusWithValue,
                actual: other.message_type(),
            }),
        }
    }

    fn pointer_or_text(&mut self, request: Message) -> Result<u64> {
        let (success, value) = self.status_with_value(request)?;
        if success {
            decode_pointer(&value)
        } else {
            Err(Error::NativeCall(String::from_utf8_lossy(&value).into_owned()))
        }
    }
}

fn decode_pointer(value: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        Error::Protocol(format!("Expected 8-byte value, got {} bytes", value.len()))
    })?;
    Ok(u64::from_le_bytes(bytes))
}
