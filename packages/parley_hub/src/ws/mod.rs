//! WebSocket transport.

pub mod handler;

pub use handler::{WsQuery, ws_handler};
