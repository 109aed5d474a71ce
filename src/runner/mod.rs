//! Test run: command handling, the event loop and post-run asset extraction

pub mod assets;
pub mod handler;
pub mod reactor;

pub use handler::{CommandHandler, Endpoints, Flow};
pub use reactor::{run_loop, LoopExit};
