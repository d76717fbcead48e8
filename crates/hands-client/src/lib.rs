//! Remote-hands controller client
//!
//! [`CommandClient`] drives the agent's command channel. [`FunctionServer`]
//! sits on the data channel and answers the calls that trampolines created
//! through [`CommandClient::create_function`] forward to the controller.

pub mod command;
pub mod server;

pub use command::CommandClient;
pub use server::{CallResponse, FunctionServer};
