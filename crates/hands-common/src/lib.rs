//! Remote-hands common types
//!
//! Error type, configuration, logging setup and the wire protocol shared by
//! the agent and its controllers.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod message;

pub use channel::{ChannelState, MessageChannel, DEFAULT_MAX_MESSAGE_SIZE};
pub use config::{AgentConfig, BridgeConfig, ChannelConfig};
pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_host_logging, init_logging, LogConfig};
pub use message::{Message, MessageType};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
