//! IPC between the orchestrator and its child processes
//!
//! Newline-delimited JSON over the children's stdin/stdout pipes.

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{Channel, Received};
pub use protocol::{CommandMessage, Message};
