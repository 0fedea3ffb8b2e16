//! WebSocket transport: wire formats, connection handles and the session loop

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod session;

pub use handler::ws_handler;
