#[macro_use]
extern crate tracing;

pub mod cli;
pub mod codes;
pub mod correlator;
pub mod device;
pub mod engine;
pub mod events;
pub mod guest;
pub mod host_tap;
pub mod identity;
pub mod ipc;
pub mod session;
pub mod stream;
pub mod utils;

pub use kbd_proto::EngineError;
