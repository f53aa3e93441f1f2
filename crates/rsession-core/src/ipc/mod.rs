//! Inter-process communication with engine worker processes.
//!
//! Workers listen on a loopback port. Every connection starts with a
//! credentials handshake, then carries one request/response exchange at a
//! time.

mod connection;
mod protocol;
mod server;

pub use connection::TcpConnection;
pub use protocol::{EngineRequest, EngineResponse, Value, quote, read_message, write_message};
pub use server::{Interpreter, InterpreterError, ServeMode, ServeOptions, WorkerHost, serve};
