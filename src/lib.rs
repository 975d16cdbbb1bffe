//! rtmpcast: an RTMP live streaming server core
//!
//! Accepts live audio/video ingest from RTMP publishers (OBS, ffmpeg, FMLE)
//! and fans it out in real time to any number of players on the same
//! stream:
//! - plain RTMP handshake and the full chunk codec, both directions
//! - AMF0 command decoding with typed packets
//! - one-publisher/many-players sources with a per-consumer bounded queue
//! - GOP caching so late joiners start decoding immediately
//! - jitter correction and merged writes on the play path
//!
//! # Example
//!
//! ```no_run
//! use rtmpcast::{Request, RtmpServer, ServerConfig, SourceHandler};
//!
//! struct Logging;
//!
//! #[async_trait::async_trait]
//! impl SourceHandler for Logging {
//!     async fn on_publish(&self, req: &Request) {
//!         println!("stream up: {}", req.stream_url());
//!     }
//!     async fn on_unpublish(&self, req: &Request) {
//!         println!("stream down: {}", req.stream_url());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> rtmpcast::Result<()> {
//!     let server = RtmpServer::new(ServerConfig::default(), Logging);
//!     server.run().await
//! }
//! ```

pub mod amf;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use server::{RtmpServer, ServerConfig, VhostConfig};
pub use session::{JitterAlgorithm, Request, SourceHandler, SourceRegistry};
