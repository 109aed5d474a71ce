//! vmtest - test orchestrator for automated tests inside a virtual machine
//!
//! Supervises the test runner, the command server and the backend driver,
//! and mediates every message flowing between them.

pub mod backend;
pub mod common;
pub mod ipc;
pub mod orchestrator;
pub mod runner;
pub mod session;
pub mod supervisor;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use orchestrator::{execute, Options};
