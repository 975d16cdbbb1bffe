//! Media payload inspection and the GOP cache

pub mod flv;
pub mod gop;

pub use gop::GopCache;
