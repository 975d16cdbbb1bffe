//! AMF0 serialization (the command/data encoding of RTMP)

pub mod amf0;
pub mod value;

pub use value::{Amf0Object, AmfValue};
