//! Operator control surface (§6 "Operator control surface"): a Unix-socket
//! server dispatching `kbd_proto::Request`s to the `Engine`.

mod server;

pub use server::IpcServer;
