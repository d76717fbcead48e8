//! Remote-hands core
//!
//! The pieces of the agent that talk to the operating system: local
//! channels, the memory access engine, and the native call layer used for
//! outbound calls and inbound trampolines.

pub mod address_space;
pub mod call;
pub mod fault;
pub mod memory;
pub mod native;
pub mod transport;

pub use address_space::OsAddressSpace;
pub use call::call_function;
pub use memory::{AddressSpace, MemoryEngine};
pub use native::{CallDescriptor, Trampoline, TrampolineHandler, MAX_ARITY};
pub use transport::{connect, Channel, ChannelName, ChannelStream, LocalChannel, LocalStream};
