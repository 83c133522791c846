// ABOUTME: Library root for remora - a thin russh wrapper for remote command handling.
// ABOUTME: Covers connection, streaming IO capture, waiting, abortion and exit codes.

mod buffer;
mod channel;
mod command;
mod connection;
mod error;

pub use command::RemoteCommand;
pub use connection::{Connection, SessionConfig};
pub use error::{Error, Result};
