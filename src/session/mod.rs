//! Streaming plane: requests, sources, consumers, timing

pub mod consumer;
pub mod jitter;
pub mod queue;
pub mod request;
pub mod source;

pub use consumer::Consumer;
pub use jitter::JitterAlgorithm;
pub use request::Request;
pub use source::{Source, SourceHandler, SourceRegistry};
