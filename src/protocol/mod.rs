//! RTMP wire protocol: handshake, chunking, typed packets, engine

pub mod buffer;
pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;
pub mod packet;
pub mod stack;

pub use message::{MessageHeader, RtmpMessage};
pub use packet::{Packet, Transactions};
pub use stack::{AckWindow, MessageReader, MessageWriter};
