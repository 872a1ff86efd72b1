//! Live-view WebSocket server

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::{channel_from_path, LiveViewServer, ServerHandle};
