//! Server plane: accept loop, per-connection state machine, receive tasks

pub mod config;
pub mod connection;
pub mod listener;
pub mod recv;

pub use config::{ServerConfig, VhostConfig};
pub use connection::{Connection, ConnectionHandle};
pub use listener::RtmpServer;
