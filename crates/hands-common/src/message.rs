//! Message catalog
//!
//! The closed set of messages exchanged between the agent and its
//! controller. Each message owns its field layout through [`WireMessage`];
//! [`Message`] tags them for the channel and decodes by exhaustive match on
//! the wire tag.

use crate::codec::{WireReader, WireWriter};
use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Wire tag of every message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Status = 1,
    StatusWithValue = 2,
    CloseProcess = 3,
    IsValid = 4,
    ReadMemory = 5,
    WriteMemory = 6,
    AllocateMemory = 7,
    FreeMemory = 8,
    QueryMemory = 9,
    ProtectMemory = 10,
    CallFunction = 11,
    AllocateConsole = 12,
    CreateFunction = 13,
    FreeFunction = 14,
    RemoteCall = 15,
    RemoteCallResponse = 16,
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(tag: u32) -> Result<Self> {
        Ok(match tag {
            1 => MessageType::Status,
            2 => MessageType::StatusWithValue,
            3 => MessageType::CloseProcess,
            4 => MessageType::IsValid,
            5 => MessageType::ReadMemory,
            6 => MessageType::WriteMemory,
            7 => MessageType::AllocateMemory,
            8 => MessageType::FreeMemory,
            9 => MessageType::QueryMemory,
            10 => MessageType::ProtectMemory,
            11 => MessageType::CallFunction,
            12 => MessageType::AllocateConsole,
            13 => MessageType::CreateFunction,
            14 => MessageType::FreeFunction,
            15 => MessageType::RemoteCall,
            16 => MessageType::RemoteCallResponse,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// Field layout of a single message kind.
pub trait WireMessage: Sized {
    const TYPE: MessageType;

    fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self>;

    fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()>;
}

/// `RemoteCallResponse` flag asking the agent to log the caller's stack.
pub const FLAG_PRINT_STACK: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusResponse {
    pub success: bool,
}

/// Status plus an opaque payload. What the payload means (address, flags,
/// error text) depends on the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusWithValueResponse {
    pub success: bool,
    pub value: Vec<u8>,
}

impl StatusWithValueResponse {
    /// Encoded size without the value bytes: tag, success flag, value length.
    pub const ENCODED_OVERHEAD: usize = 4 + 1 + 4;

    /// Largest value that still encodes within `max_message_size`.
    pub fn max_value_len(max_message_size: usize) -> usize {
        max_message_size.saturating_sub(Self::ENCODED_OVERHEAD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseProcessRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsValidRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadMemoryRequest {
    pub address: u64,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteMemoryRequest {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocateMemoryRequest {
    pub size: u32,
    pub allocation_type: u32,
    pub protect: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeMemoryRequest {
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryMemoryRequest {
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtectMemoryRequest {
    pub address: u64,
    pub size: u32,
    pub protect: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallFunctionRequest {
    pub address: u64,
    pub arguments: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocateConsoleRequest;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateFunctionRequest {
    pub name: String,
    pub arg_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FreeFunctionRequest {
    pub name: String,
}

/// Issued by a trampoline to the controller over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteCallRequest {
    pub name: String,
    pub arguments: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteCallResponse {
    pub return_value: u64,
    pub flags: u32,
}

impl RemoteCallResponse {
    pub fn wants_stack_trace(&self) -> bool {
        self.flags & FLAG_PRINT_STACK != 0
    }
}

impl WireMessage for StatusResponse {
    const TYPE: MessageType = MessageType::Status;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            success: r.read_bool()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_bool(self.success)
    }
}

impl WireMessage for StatusWithValueResponse {
    const TYPE: MessageType = MessageType::StatusWithValue;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            success: r.read_bool()?,
            value: r.read_bytes()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_bool(self.success)?;
        w.write_bytes(&self.value)
    }
}

impl WireMessage for CloseProcessRequest {
    const TYPE: MessageType = MessageType::CloseProcess;

    fn read_from<R: Read>(_: &mut WireReader<R>) -> Result<Self> {
        Ok(Self)
    }

    fn write_to<W: Write>(&self, _: &mut WireWriter<W>) -> Result<()> {
        Ok(())
    }
}

impl WireMessage for IsValidRequest {
    const TYPE: MessageType = MessageType::IsValid;

    fn read_from<R: Read>(_: &mut WireReader<R>) -> Result<Self> {
        Ok(Self)
    }

    fn write_to<W: Write>(&self, _: &mut WireWriter<W>) -> Result<()> {
        Ok(())
    }
}

impl WireMessage for ReadMemoryRequest {
    const TYPE: MessageType = MessageType::ReadMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
            size: r.read_u32()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)?;
        w.write_u32(self.size)
    }
}

impl WireMessage for WriteMemoryRequest {
    const TYPE: MessageType = MessageType::WriteMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
            data: r.read_bytes()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)?;
        w.write_bytes(&self.data)
    }
}

impl WireMessage for AllocateMemoryRequest {
    const TYPE: MessageType = MessageType::AllocateMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            size: r.read_u32()?,
            allocation_type: r.read_u32()?,
            protect: r.read_u32()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_u32(self.size)?;
        w.write_u32(self.allocation_type)?;
        w.write_u32(self.protect)
    }
}

impl WireMessage for FreeMemoryRequest {
    const TYPE: MessageType = MessageType::FreeMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)
    }
}

impl WireMessage for QueryMemoryRequest {
    const TYPE: MessageType = MessageType::QueryMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)
    }
}

impl WireMessage for ProtectMemoryRequest {
    const TYPE: MessageType = MessageType::ProtectMemory;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
            size: r.read_u32()?,
            protect: r.read_u32()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)?;
        w.write_u32(self.size)?;
        w.write_u32(self.protect)
    }
}

impl WireMessage for CallFunctionRequest {
    const TYPE: MessageType = MessageType::CallFunction;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            address: r.read_pointer()?,
            arguments: r.read_pointers()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.address)?;
        w.write_pointers(&self.arguments)
    }
}

impl WireMessage for AllocateConsoleRequest {
    const TYPE: MessageType = MessageType::AllocateConsole;

    fn read_from<R: Read>(_: &mut WireReader<R>) -> Result<Self> {
        Ok(Self)
    }

    fn write_to<W: Write>(&self, _: &mut WireWriter<W>) -> Result<()> {
        Ok(())
    }
}

impl WireMessage for CreateFunctionRequest {
    const TYPE: MessageType = MessageType::CreateFunction;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            name: r.read_string()?,
            arg_count: r.read_u32()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_string(&self.name)?;
        w.write_u32(self.arg_count)
    }
}

impl WireMessage for FreeFunctionRequest {
    const TYPE: MessageType = MessageType::FreeFunction;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            name: r.read_string()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_string(&self.name)
    }
}

impl WireMessage for RemoteCallRequest {
    const TYPE: MessageType = MessageType::RemoteCall;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            name: r.read_string()?,
            arguments: r.read_pointers()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_string(&self.name)?;
        w.write_pointers(&self.arguments)
    }
}

impl WireMessage for RemoteCallResponse {
    const TYPE: MessageType = MessageType::RemoteCallResponse;

    fn read_from<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            return_value: r.read_pointer()?,
            flags: r.read_u32()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_pointer(self.return_value)?;
        w.write_u32(self.flags)
    }
}

/// Any message of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status(StatusResponse),
    StatusWithValue(StatusWithValueResponse),
    CloseProcess(CloseProcessRequest),
    IsValid(IsValidRequest),
    ReadMemory(ReadMemoryRequest),
    WriteMemory(WriteMemoryRequest),
    AllocateMemory(AllocateMemoryRequest),
    FreeMemory(FreeMemoryRequest),
    QueryMemory(QueryMemoryRequest),
    ProtectMemory(ProtectMemoryRequest),
    CallFunction(CallFunctionRequest),
    AllocateConsole(AllocateConsoleRequest),
    CreateFunction(CreateFunctionRequest),
    FreeFunction(FreeFunctionRequest),
    RemoteCall(RemoteCallRequest),
    RemoteCallResponse(RemoteCallResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Status(_) => MessageType::Status,
            Message::StatusWithValue(_) => MessageType::StatusWithValue,
            Message::CloseProcess(_) => MessageType::CloseProcess,
            Message::IsValid(_) => MessageType::IsValid,
            Message::ReadMemory(_) => MessageType::ReadMemory,
            Message::WriteMemory(_) => MessageType::WriteMemory,
            Message::AllocateMemory(_) => MessageType::AllocateMemory,
            Message::FreeMemory(_) => MessageType::FreeMemory,
            Message::QueryMemory(_) => MessageType::QueryMemory,
            Message::ProtectMemory(_) => MessageType::ProtectMemory,
            Message::CallFunction(_) => MessageType::CallFunction,
            Message::AllocateConsole(_) => MessageType::AllocateConsole,
            Message::CreateFunction(_) => MessageType::CreateFunction,
            Message::FreeFunction(_) => MessageType::FreeFunction,
            Message::RemoteCall(_) => MessageType::RemoteCall,
            Message::RemoteCallResponse(_) => MessageType::RemoteCallResponse,
        }
    }

    /// Shorthand for a `Status` reply.
    pub fn status(success: bool) -> Self {
        Message::Status(StatusResponse { success })
    }

    /// Shorthand for a `StatusWithValue` reply.
    pub fn status_with_value(success: bool, value: Vec<u8>) -> Self {
        Message::StatusWithValue(StatusWithValueResponse { success, value })
    }

    /// Successful reply carrying a pointer-sized value as 8 LE bytes.
    pub fn pointer_value(value: u64) -> Self {
        Self::status_with_value(true, value.to_le_bytes().to_vec())
    }

    /// Failed reply carrying UTF-8 error text.
    pub fn failure_text(text: impl AsRef<str>) -> Self {
        Self::status_with_value(false, text.as_ref().as_bytes().to_vec())
    }

    /// Encode tag and fields.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new(Vec::new());
        w.write_u32(self.message_type() as u32)?;
        match self {
            Message::Status(m) => m.write_to(&mut w)?,
            Message::StatusWithValue(m) => m.write_to(&mut w)?,
            Message::CloseProcess(m) => m.write_to(&mut w)?,
            Message::IsValid(m) => m.write_to(&mut w)?,
            Message::ReadMemory(m) => m.write_to(&mut w)?,
            Message::WriteMemory(m) => m.write_to(&mut w)?,
            Message::AllocateMemory(m) => m.write_to(&mut w)?,
            Message::FreeMemory(m) => m.write_to(&mut w)?,
            Message::QueryMemory(m) => m.write_to(&mut w)?,
            Message::ProtectMemory(m) => m.write_to(&mut w)?,
            Message::CallFunction(m) => m.write_to(&mut w)?,
            Message::AllocateConsole(m) => m.write_to(&mut w)?,
            Message::CreateFunction(m) => m.write_to(&mut w)?,
            Message::FreeFunction(m) => m.write_to(&mut w)?,
            Message::RemoteCall(m) => m.write_to(&mut w)?,
            Message::RemoteCallResponse(m) => m.write_to(&mut w)?,
        }
        Ok(w.into_inner())
    }

    /// Decode a complete payload. Trailing bytes are a protocol error.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let message_type = MessageType::try_from(r.read_u32()?)?;
        let message = match message_type {
            MessageType::Status => Message::Status(WireMessage::read_from(&mut r)?),
            MessageType::StatusWithValue => {
                Message::StatusWithValue(WireMessage::read_from(&mut r)?)
            }
            MessageType::CloseProcess => Message::CloseProcess(WireMessage::read_from(&mut r)?),
            MessageType::IsValid => Message::IsValid(WireMessage::read_from(&mut r)?),
            MessageType::ReadMemory => Message::ReadMemory(WireMessage::read_from(&mut r)?),
            MessageType::WriteMemory => Message::WriteMemory(WireMessage::read_from(&mut r)?),
            MessageType::AllocateMemory => {
                Message::AllocateMemory(WireMessage::read_from(&mut r)?)
            }
            MessageType::FreeMemory => Message::FreeMemory(WireMessage::read_from(&mut r)?),
            MessageType::QueryMemory => Message::QueryMemory(WireMessage::read_from(&mut r)?),
            MessageType::ProtectMemory => Message::ProtectMemory(WireMessage::read_from(&mut r)?),
            MessageType::CallFunction => Message::CallFunction(WireMessage::read_from(&mut r)?),
            MessageType::AllocateConsole => {
                Message::AllocateConsole(WireMessage::read_from(&mut r)?)
            }
            MessageType::CreateFunction => {
                Message::CreateFunction(WireMessage::read_from(&mut r)?)
            }
            MessageType::FreeFunction => Message::FreeFunction(WireMessage::read_from(&mut r)?),
            MessageType::RemoteCall => Message::RemoteCall(WireMessage::read_from(&mut r)?),
            MessageType::RemoteCallResponse => {
                Message::RemoteCallResponse(WireMessage::read_from(&mut r)?)
            }
        };

        let rest = r.into_inner();
        if !rest.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {:?}",
                rest.len(),
                message_type
            )));
        }
        Ok(message)
    }
}
