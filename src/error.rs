//! Unified error types for rtmpcast
//!
//! Every failure surfaces as a single [`Error`] with a kind discriminator.
//! Two predicates drive connection teardown policy:
//! [`Error::is_gracefully_closed`] (peer FIN, logged silently) and
//! [`Error::is_system_control`] (republish/disconnect codes that are part of
//! normal session control rather than faults).

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// Peer closed the connection with a FIN on a read
    ConnectionClosed,
    /// Handshake-phase failure
    Handshake(HandshakeError),
    /// Chunk framing or message codec violation
    Protocol(ProtocolError),
    /// AMF0 encoding/decoding error
    Amf(AmfError),
    /// tcUrl could not be resolved into schema/host/vhost/app/port
    TcUrlInvalid(String),
    /// publish/play named an empty stream
    StreamNameEmpty,
    /// A second publisher tried to take an actively published stream
    StreamBusy(String),
    /// Same as StreamBusy, but the losing side must not unpublish the source
    SystemStreamBusy(String),
    /// Publisher stalled past the inactivity timeout
    SocketTimeout,
    /// The connection was expired administratively
    UserDisconnect,
    /// A publisher re-issued publish on the same stream; reset the session
    ControlRepublish,
}

impl Error {
    /// True when the peer simply went away; logged at debug, never error.
    pub fn is_gracefully_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// True for codes that steer the session rather than report a fault.
    pub fn is_system_control(&self) -> bool {
        matches!(self, Error::ControlRepublish | Error::UserDisconnect)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed by peer"),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::TcUrlInvalid(url) => write!(f, "Invalid tcUrl: {}", url),
            Error::StreamNameEmpty => write!(f, "Empty stream name is not allowed"),
            Error::StreamBusy(url) => write!(f, "Stream is already publishing: {}", url),
            Error::SystemStreamBusy(url) => {
                write!(f, "Stream is already publishing (kept intact): {}", url)
            }
            Error::SocketTimeout => write!(f, "Publisher timed out"),
            Error::UserDisconnect => write!(f, "Connection expired"),
            Error::ControlRepublish => write!(f, "Publish session reset by client"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

/// Handshake-phase errors
#[derive(Debug)]
pub enum HandshakeError {
    /// C0 was not 0x03; encrypted/tunnelled variants are not supported
    PlainRequired(u8),
    /// The peer sent fewer handshake bytes than the phase requires
    UnexpectedEof,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::PlainRequired(v) => {
                write!(f, "only plain RTMP is supported, got version 0x{:02x}", v)
            }
            HandshakeError::UnexpectedEof => write!(f, "short read during handshake"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Chunk framing and message codec errors
#[derive(Debug)]
pub enum ProtocolError {
    /// Impossible basic-header cid encoding
    BasicHeader(u8),
    /// Chunk arrived in a state the fmt rules forbid
    ChunkStart(String),
    /// A require() could not be satisfied within the buffer capacity
    BufferOverflow { required: usize, capacity: usize },
    /// _result/_error arrived with no matching outbound request
    NoRequest(f64),
    /// AMF3 command or data message received
    Amf3NotSupported,
    /// Typed packet body failed to decode
    MessageDecode(String),
    /// Typed packet body failed to encode
    MessageEncode(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BasicHeader(b) => {
                write!(f, "invalid basic header byte 0x{:02x}", b)
            }
            ProtocolError::ChunkStart(msg) => write!(f, "chunk stream violation: {}", msg),
            ProtocolError::BufferOverflow { required, capacity } => {
                write!(
                    f,
                    "recv buffer overflow: required {} bytes, capacity {}",
                    required, capacity
                )
            }
            ProtocolError::NoRequest(tid) => {
                write!(f, "response with no matching request, transaction_id={}", tid)
            }
            ProtocolError::Amf3NotSupported => write!(f, "AMF3 is not supported"),
            ProtocolError::MessageDecode(msg) => write!(f, "message decode failed: {}", msg),
            ProtocolError::MessageEncode(msg) => write!(f, "message encode failed: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF0 codec errors
#[derive(Debug)]
pub enum AmfError {
    /// Truncated input
    UnexpectedEof,
    /// Marker byte outside the AMF0 set
    UnknownMarker(u8),
    /// A typed reader found a different marker than it expected
    MarkerMismatch { expected: u8, actual: u8 },
    /// Non-UTF-8 bytes in a string body
    InvalidUtf8,
    /// Object properties not terminated by 0x00 0x00 0x09
    InvalidObjectEnd,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnexpectedEof => write!(f, "unexpected end of AMF0 data"),
            AmfError::UnknownMarker(m) => write!(f, "unknown AMF0 marker: 0x{:02x}", m),
            AmfError::MarkerMismatch { expected, actual } => {
                write!(
                    f,
                    "AMF0 marker mismatch: expected 0x{:02x}, got 0x{:02x}",
                    expected, actual
                )
            }
            AmfError::InvalidUtf8 => write!(f, "invalid UTF-8 in AMF0 string"),
            AmfError::InvalidObjectEnd => write!(f, "invalid AMF0 object end marker"),
        }
    }
}

impl std::error::Error for AmfError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Handshake(HandshakeError::PlainRequired(0x06));
        assert!(err.to_string().contains("0x06"));

        let err = Error::Protocol(ProtocolError::ChunkStart("fresh chunk must be fmt=0".into()));
        assert!(err.to_string().contains("fmt=0"));

        let err = Error::Amf(AmfError::MarkerMismatch { expected: 0x02, actual: 0x00 });
        assert!(err.to_string().contains("0x02"));
        assert!(err.to_string().contains("0x00"));

        let err = Error::StreamBusy("live/cam01".into());
        assert!(err.to_string().contains("live/cam01"));
    }

    #[test]
    fn test_gracefully_closed() {
        assert!(Error::ConnectionClosed.is_gracefully_closed());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .is_gracefully_closed());
        assert!(!Error::SocketTimeout.is_gracefully_closed());
        assert!(!Error::Protocol(ProtocolError::Amf3NotSupported).is_gracefully_closed());
    }

    #[test]
    fn test_system_control() {
        assert!(Error::ControlRepublish.is_system_control());
        assert!(Error::UserDisconnect.is_system_control());
        assert!(!Error::StreamBusy("a/b/c".into()).is_system_control());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = ProtocolError::Amf3NotSupported.into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = AmfError::UnexpectedEof.into();
        assert!(matches!(err, Error::Amf(_)));

        let err: Error = HandshakeError::UnexpectedEof.into();
        assert!(matches!(err, Error::Handshake(_)));
    }
}
