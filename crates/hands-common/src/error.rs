//! Error types for remote-hands

use crate::channel::ChannelState;
use crate::message::MessageType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel I/O error: {0}")]
    ChannelIo(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("Unexpected message: expected {expected:?}, got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Cannot {operation} while channel is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },

    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(usize),

    #[error("Native call failed: {0}")]
    NativeCall(String),

    #[error("Access violation at {address:#x} (signal {signal})")]
    Fault { signal: i32, address: usize },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error ends the session it occurred in.
    ///
    /// Channel failures and protocol violations leave the byte stream in an
    /// unknown position, so the owning service must drop the connection and
    /// wait for a new one.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::ChannelIo(_)
                | Error::Protocol(_)
                | Error::UnknownMessageType(_)
                | Error::UnexpectedMessage { .. }
                | Error::FrameTooLarge { .. }
                | Error::NotConnected
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
