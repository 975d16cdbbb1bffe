//! Typed RTMP packets
//!
//! The chunk layer deals in opaque payloads; this layer gives the small set
//! of command, data, and protocol-control messages concrete types with
//! symmetric decode/encode. Inbound `_result`/`_error` responses carry no
//! command name of their own, so decoding them consults the transaction
//! table recorded when the request packet was sent.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::amf::{amf0, Amf0Object, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::message::RtmpMessage;

/// Outstanding request correlation: transaction id -> command name
#[derive(Debug, Default)]
pub struct Transactions {
    inner: Mutex<HashMap<u64, String>>,
}

impl Transactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound command that expects a `_result`/`_error`
    pub fn record(&self, transaction_id: f64, command_name: &str) {
        self.inner
            .lock()
            .expect("transactions lock")
            .insert(transaction_id.to_bits(), command_name.to_string());
    }

    fn lookup(&self, transaction_id: f64) -> Option<String> {
        self.inner
            .lock()
            .expect("transactions lock")
            .get(&transaction_id.to_bits())
            .cloned()
    }
}

/// User control event (message type 4)
#[derive(Debug, Clone, PartialEq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    /// Event types outside the RTMP spec's set pass through untouched
    Unknown { event_type: u16, data: Bytes },
}

/// A decoded RTMP packet
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectRes(ConnectResPacket),
    CreateStream(CreateStreamPacket),
    CreateStreamRes(CreateStreamResPacket),
    FmleStart(FmleStartPacket),
    FmleStartRes(FmleStartResPacket),
    Publish(PublishPacket),
    Play(PlayPacket),
    Pause(PausePacket),
    CloseStream(CloseStreamPacket),
    OnStatusCall(OnStatusCallPacket),
    OnStatusData(OnStatusDataPacket),
    SampleAccess(SampleAccessPacket),
    OnMetadata(OnMetadataPacket),
    SetChunkSize(SetChunkSizePacket),
    SetWindowAckSize(SetWindowAckSizePacket),
    SetPeerBandwidth(SetPeerBandwidthPacket),
    Acknowledgement(AcknowledgementPacket),
    UserControl(UserControlPacket),
    /// Unknown AMF0 command, kept opaque and dropped by callers
    Call(CallPacket),
}

impl Packet {
    /// Decode a typed packet out of a complete message.
    ///
    /// Only command, data, and protocol-control message types decode here;
    /// AV payloads never reach this layer.
    pub fn decode(msg: &RtmpMessage, transactions: &Transactions) -> Result<Packet> {
        let header = &msg.header;
        let mut buf = msg.payload.clone();

        if header.is_amf3_command() || header.is_amf3_data() {
            return Err(ProtocolError::Amf3NotSupported.into());
        }

        if header.is_amf0_command() || header.is_amf0_data() {
            let command = amf0::read_string(&mut buf).map_err(crate::error::Error::from)?;

            if command == CMD_RESULT || command == CMD_ERROR {
                let transaction_id = amf0::read_number(&mut buf)?;

                let request = transactions
                    .lookup(transaction_id)
                    .ok_or(ProtocolError::NoRequest(transaction_id))?;

                let mut full = msg.payload.clone();
                return match request.as_str() {
                    CMD_CONNECT => Ok(Packet::ConnectRes(ConnectResPacket::decode(&mut full)?)),
                    CMD_CREATE_STREAM => {
                        Ok(Packet::CreateStreamRes(CreateStreamResPacket::decode(&mut full)?))
                    }
                    CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_UNPUBLISH => {
                        Ok(Packet::FmleStartRes(FmleStartResPacket::decode(&mut full)?))
                    }
                    _ => Err(ProtocolError::NoRequest(transaction_id).into()),
                };
            }

            let mut full = msg.payload.clone();
            return match command.as_str() {
                CMD_CONNECT => Ok(Packet::Connect(ConnectPacket::decode(&mut full)?)),
                CMD_CREATE_STREAM => {
                    Ok(Packet::CreateStream(CreateStreamPacket::decode(&mut full)?))
                }
                CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_UNPUBLISH => {
                    Ok(Packet::FmleStart(FmleStartPacket::decode(&mut full)?))
                }
                CMD_PUBLISH => Ok(Packet::Publish(PublishPacket::decode(&mut full)?)),
                CMD_PLAY => Ok(Packet::Play(PlayPacket::decode(&mut full)?)),
                CMD_PAUSE => Ok(Packet::Pause(PausePacket::decode(&mut full)?)),
                CMD_CLOSE_STREAM => {
                    Ok(Packet::CloseStream(CloseStreamPacket::decode(&mut full)?))
                }
                CMD_ON_METADATA | CMD_SET_DATA_FRAME => {
                    Ok(Packet::OnMetadata(OnMetadataPacket::decode(&mut full)?))
                }
                _ => {
                    warn!(command = %command, "drop unknown amf0 command");
                    Ok(Packet::Call(CallPacket::decode(&mut full)?))
                }
            };
        }

        match header.message_type {
            MSG_SET_CHUNK_SIZE => {
                Ok(Packet::SetChunkSize(SetChunkSizePacket::decode(&mut buf)?))
            }
            MSG_WINDOW_ACK_SIZE => {
                Ok(Packet::SetWindowAckSize(SetWindowAckSizePacket::decode(&mut buf)?))
            }
            MSG_SET_PEER_BANDWIDTH => {
                Ok(Packet::SetPeerBandwidth(SetPeerBandwidthPacket::decode(&mut buf)?))
            }
            MSG_ACKNOWLEDGEMENT => {
                Ok(Packet::Acknowledgement(AcknowledgementPacket::decode(&mut buf)?))
            }
            MSG_USER_CONTROL => Ok(Packet::UserControl(UserControlPacket::decode(&mut buf)?)),
            other => Err(ProtocolError::MessageDecode(format!(
                "message type {} has no packet decoding",
                other
            ))
            .into()),
        }
    }

    /// Message type id this packet travels as
    pub fn message_type(&self) -> u8 {
        match self {
            Packet::Connect(_)
            | Packet::ConnectRes(_)
            | Packet::CreateStream(_)
            | Packet::CreateStreamRes(_)
            | Packet::FmleStart(_)
            | Packet::FmleStartRes(_)
            | Packet::Publish(_)
            | Packet::Play(_)
            | Packet::Pause(_)
            | Packet::CloseStream(_)
            | Packet::OnStatusCall(_)
            | Packet::Call(_) => MSG_COMMAND_AMF0,
            Packet::OnStatusData(_) | Packet::SampleAccess(_) | Packet::OnMetadata(_) => {
                MSG_DATA_AMF0
            }
            Packet::SetChunkSize(_) => MSG_SET_CHUNK_SIZE,
            Packet::SetWindowAckSize(_) => MSG_WINDOW_ACK_SIZE,
            Packet::SetPeerBandwidth(_) => MSG_SET_PEER_BANDWIDTH,
            Packet::Acknowledgement(_) => MSG_ACKNOWLEDGEMENT,
            Packet::UserControl(_) => MSG_USER_CONTROL,
        }
    }

    /// Chunk stream this packet prefers on the wire
    pub fn prefer_cid(&self) -> u32 {
        match self {
            Packet::Connect(_)
            | Packet::ConnectRes(_)
            | Packet::CreateStream(_)
            | Packet::CreateStreamRes(_)
            | Packet::FmleStart(_)
            | Packet::FmleStartRes(_)
            | Packet::Call(_) => CID_OVER_CONNECTION,
            Packet::Publish(_)
            | Packet::Play(_)
            | Packet::Pause(_)
            | Packet::CloseStream(_)
            | Packet::OnStatusCall(_)
            | Packet::OnStatusData(_)
            | Packet::SampleAccess(_) => CID_OVER_STREAM,
            Packet::OnMetadata(_) => CID_OVER_CONNECTION2,
            Packet::SetChunkSize(_)
            | Packet::SetWindowAckSize(_)
            | Packet::SetPeerBandwidth(_)
            | Packet::Acknowledgement(_)
            | Packet::UserControl(_) => CID_PROTOCOL_CONTROL,
        }
    }

    /// Serialize the packet body
    pub fn encode_payload(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Packet::Connect(p) => p.encode(&mut buf),
            Packet::ConnectRes(p) => p.encode(&mut buf),
            Packet::CreateStream(p) => p.encode(&mut buf),
            Packet::CreateStreamRes(p) => p.encode(&mut buf),
            Packet::FmleStart(p) => p.encode(&mut buf),
            Packet::FmleStartRes(p) => p.encode(&mut buf),
            Packet::Publish(p) => p.encode(&mut buf),
            Packet::Play(p) => p.encode(&mut buf),
            Packet::Pause(p) => p.encode(&mut buf),
            Packet::CloseStream(p) => p.encode(&mut buf),
            Packet::OnStatusCall(p) => p.encode(&mut buf),
            Packet::OnStatusData(p) => p.encode(&mut buf),
            Packet::SampleAccess(p) => p.encode(&mut buf),
            Packet::OnMetadata(p) => p.encode(&mut buf),
            Packet::SetChunkSize(p) => p.encode(&mut buf),
            Packet::SetWindowAckSize(p) => p.encode(&mut buf),
            Packet::SetPeerBandwidth(p) => p.encode(&mut buf),
            Packet::Acknowledgement(p) => p.encode(&mut buf),
            Packet::UserControl(p) => p.encode(&mut buf),
            Packet::Call(p) => p.encode(&mut buf),
        }
        Ok(buf.freeze())
    }

    /// Command name this packet answers to, if it expects a response
    pub fn expects_response(&self) -> Option<(f64, &'static str)> {
        match self {
            Packet::Connect(p) => Some((p.transaction_id, CMD_CONNECT)),
            Packet::CreateStream(p) => Some((p.transaction_id, CMD_CREATE_STREAM)),
            Packet::FmleStart(p) => {
                let name = match p.command_name.as_str() {
                    CMD_RELEASE_STREAM => CMD_RELEASE_STREAM,
                    CMD_FC_PUBLISH => CMD_FC_PUBLISH,
                    _ => CMD_UNPUBLISH,
                };
                Some((p.transaction_id, name))
            }
            _ => None,
        }
    }
}

/// connect(app) command
#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub transaction_id: f64,
    pub command_object: Amf0Object,
    pub args: Option<Amf0Object>,
}

impl ConnectPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let command = amf0::read_string(buf)?;
        if command != CMD_CONNECT {
            return Err(ProtocolError::MessageDecode(format!(
                "expected connect, got {}",
                command
            ))
            .into());
        }

        let transaction_id = amf0::read_number(buf)?;
        if transaction_id != 1.0 {
            // some encoders send other ids; the RTMP spec asks for 1.0
            warn!(transaction_id, "connect transaction_id is not 1.0");
        }

        let command_object = amf0::read_object(buf)?;

        let mut args = None;
        if !buf.is_empty() {
            match amf0::read_any(buf)? {
                AmfValue::Object(o) => args = Some(o),
                other => {
                    warn!(?other, "drop non-object connect args");
                }
            }
        }

        Ok(Self { transaction_id, command_object, args })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_CONNECT);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_object(buf, &self.command_object);
        if let Some(args) = &self.args {
            amf0::write_object(buf, args);
        }
    }

    pub fn tc_url(&self) -> Option<&str> {
        self.command_object.get_str("tcUrl")
    }

    pub fn object_encoding(&self) -> f64 {
        self.command_object.get_number("objectEncoding").unwrap_or(0.0)
    }
}

/// _result for connect
#[derive(Debug, Clone)]
pub struct ConnectResPacket {
    pub transaction_id: f64,
    pub props: Amf0Object,
    pub info: Amf0Object,
}

impl ConnectResPacket {
    /// The server's standard accept response (S2 scenario contents)
    pub fn accepted(object_encoding: f64) -> Self {
        let mut props = Amf0Object::new();
        props.set("fmsVer", FMS_VERSION);
        props.set("capabilities", FMS_CAPABILITIES);

        let mut info = Amf0Object::new();
        info.set("level", STATUS_LEVEL_STATUS);
        info.set("code", NC_CONNECT_SUCCESS);
        info.set("description", "Connection succeeded");
        info.set("objectEncoding", object_encoding);

        Self { transaction_id: 1.0, props, info }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        let props = amf0::read_object(buf)?;
        let info = amf0::read_object(buf)?;
        Ok(Self { transaction_id, props, info })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_RESULT);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_object(buf, &self.props);
        amf0::write_object(buf, &self.info);
    }
}

/// createStream command
#[derive(Debug, Clone)]
pub struct CreateStreamPacket {
    pub transaction_id: f64,
}

impl CreateStreamPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        Ok(Self { transaction_id })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_CREATE_STREAM);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
    }
}

/// _result for createStream
#[derive(Debug, Clone)]
pub struct CreateStreamResPacket {
    pub transaction_id: f64,
    pub stream_id: f64,
}

impl CreateStreamResPacket {
    pub fn new(transaction_id: f64, stream_id: u32) -> Self {
        Self { transaction_id, stream_id: stream_id as f64 }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        let stream_id = amf0::read_number(buf)?;
        Ok(Self { transaction_id, stream_id })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_RESULT);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_number(buf, self.stream_id);
    }
}

/// releaseStream / FCPublish / FCUnpublish command (the FMLE trio)
#[derive(Debug, Clone)]
pub struct FmleStartPacket {
    pub command_name: String,
    pub transaction_id: f64,
    pub stream_name: String,
}

impl FmleStartPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let command_name = amf0::read_string(buf)?;
        if command_name != CMD_RELEASE_STREAM
            && command_name != CMD_FC_PUBLISH
            && command_name != CMD_UNPUBLISH
        {
            return Err(ProtocolError::MessageDecode(format!(
                "unexpected FMLE command {}",
                command_name
            ))
            .into());
        }
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        let stream_name = amf0::read_string(buf)?;
        Ok(Self { command_name, transaction_id, stream_name })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, &self.command_name);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_string(buf, &self.stream_name);
    }

    pub fn is_unpublish(&self) -> bool {
        self.command_name == CMD_UNPUBLISH
    }
}

/// _result for the FMLE trio
#[derive(Debug, Clone)]
pub struct FmleStartResPacket {
    pub transaction_id: f64,
}

impl FmleStartResPacket {
    pub fn new(transaction_id: f64) -> Self {
        Self { transaction_id }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        amf0::read_undefined(buf)?;
        Ok(Self { transaction_id })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_RESULT);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_undefined(buf);
    }
}

/// publish(stream, type) command
#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub transaction_id: f64,
    pub stream_name: String,
    pub publish_type: String,
}

impl PublishPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        let stream_name = amf0::read_string(buf)?;
        let publish_type = if buf.is_empty() {
            "live".to_string()
        } else {
            amf0::read_string(buf)?
        };
        Ok(Self { transaction_id, stream_name, publish_type })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_PUBLISH);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_string(buf, &self.stream_name);
        amf0::write_string(buf, &self.publish_type);
    }
}

/// play(stream, start, duration, reset) command
#[derive(Debug, Clone)]
pub struct PlayPacket {
    pub transaction_id: f64,
    pub stream_name: String,
    pub start: f64,
    pub duration: f64,
    pub reset: bool,
}

impl PlayPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        let stream_name = amf0::read_string(buf)?;

        let start = if buf.is_empty() { -2.0 } else { amf0::read_number(buf)? };
        let duration = if buf.is_empty() { -1.0 } else { amf0::read_number(buf)? };
        let reset = if buf.is_empty() {
            true
        } else {
            // some clients send reset as a number
            match amf0::read_any(buf)? {
                AmfValue::Boolean(b) => b,
                AmfValue::Number(n) => n != 0.0,
                _ => true,
            }
        };

        Ok(Self { transaction_id, stream_name, start, duration, reset })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_PLAY);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_string(buf, &self.stream_name);
        amf0::write_number(buf, self.start);
        amf0::write_number(buf, self.duration);
        amf0::write_boolean(buf, self.reset);
    }
}

/// pause(is_pause, time) command
#[derive(Debug, Clone)]
pub struct PausePacket {
    pub transaction_id: f64,
    pub is_pause: bool,
    pub time_ms: f64,
}

impl PausePacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        let is_pause = amf0::read_boolean(buf)?;
        let time_ms = if buf.is_empty() { 0.0 } else { amf0::read_number(buf)? };
        Ok(Self { transaction_id, is_pause, time_ms })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_PAUSE);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
        amf0::write_boolean(buf, self.is_pause);
        amf0::write_number(buf, self.time_ms);
    }
}

/// closeStream command
#[derive(Debug, Clone)]
pub struct CloseStreamPacket {
    pub transaction_id: f64,
}

impl CloseStreamPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _command = amf0::read_string(buf)?;
        let transaction_id = amf0::read_number(buf)?;
        amf0::read_null(buf)?;
        Ok(Self { transaction_id })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_CLOSE_STREAM);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
    }
}

/// onStatus command (stream-level status notification); the FMLE
/// onFCPublish/onFCUnpublish notifications share the shape under another
/// command name
#[derive(Debug, Clone)]
pub struct OnStatusCallPacket {
    pub command: String,
    pub args: Amf0Object,
}

impl OnStatusCallPacket {
    pub fn new(level: &str, code: &str, description: &str) -> Self {
        let mut args = Amf0Object::new();
        args.set("level", level);
        args.set("code", code);
        args.set("description", description);
        Self { command: CMD_ON_STATUS.to_string(), args }
    }

    pub fn status(code: &str, description: &str) -> Self {
        Self::new(STATUS_LEVEL_STATUS, code, description)
    }

    pub fn error(code: &str, description: &str) -> Self {
        Self::new(STATUS_LEVEL_ERROR, code, description)
    }

    pub fn on_fc_publish(description: &str) -> Self {
        let mut packet = Self::status(NS_PUBLISH_START, description);
        packet.command = CMD_ON_FC_PUBLISH.to_string();
        packet
    }

    pub fn on_fc_unpublish(description: &str) -> Self {
        let mut packet = Self::status(NS_UNPUBLISH_SUCCESS, description);
        packet.command = CMD_ON_FC_UNPUBLISH.to_string();
        packet
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, &self.command);
        amf0::write_number(buf, 0.0);
        amf0::write_null(buf);
        amf0::write_object(buf, &self.args);
    }
}

/// onStatus data message (e.g. NetStream.Data.Start)
#[derive(Debug, Clone)]
pub struct OnStatusDataPacket {
    pub args: Amf0Object,
}

impl OnStatusDataPacket {
    pub fn new(code: &str) -> Self {
        let mut args = Amf0Object::new();
        args.set("code", code);
        Self { args }
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_ON_STATUS);
        amf0::write_object(buf, &self.args);
    }
}

/// |RtmpSampleAccess data message sent at play start
#[derive(Debug, Clone)]
pub struct SampleAccessPacket {
    pub video_sample_access: bool,
    pub audio_sample_access: bool,
}

impl SampleAccessPacket {
    pub fn new() -> Self {
        Self { video_sample_access: false, audio_sample_access: false }
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, "|RtmpSampleAccess");
        amf0::write_boolean(buf, self.video_sample_access);
        amf0::write_boolean(buf, self.audio_sample_access);
    }
}

impl Default for SampleAccessPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// onMetaData data message, with or without the @setDataFrame wrapper
#[derive(Debug, Clone)]
pub struct OnMetadataPacket {
    pub metadata: AmfValue,
}

impl OnMetadataPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let mut name = amf0::read_string(buf)?;
        if name == CMD_SET_DATA_FRAME {
            name = amf0::read_string(buf)?;
        }
        if name != CMD_ON_METADATA {
            return Err(ProtocolError::MessageDecode(format!(
                "expected onMetaData, got {}",
                name
            ))
            .into());
        }

        let metadata = match amf0::read_any(buf)? {
            v @ (AmfValue::Object(_) | AmfValue::EcmaArray(_)) => v,
            other => {
                return Err(ProtocolError::MessageDecode(format!(
                    "metadata must be an object, got {:?}",
                    other
                ))
                .into())
            }
        };

        Ok(Self { metadata })
    }

    /// Encodes as a bare onMetaData message (the wrapper is stripped)
    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, CMD_ON_METADATA);
        amf0::write_any(buf, &self.metadata);
    }
}

/// Unknown command, decoded far enough to log and drop
#[derive(Debug, Clone)]
pub struct CallPacket {
    pub command_name: String,
    pub transaction_id: f64,
}

impl CallPacket {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let command_name = amf0::read_string(buf)?;
        // unknown commands get dropped anyway; tolerate any body shape
        let transaction_id = match amf0::read_any(buf) {
            Ok(AmfValue::Number(n)) => n,
            _ => 0.0,
        };
        Ok(Self { command_name, transaction_id })
    }

    fn encode(&self, buf: &mut BytesMut) {
        amf0::write_string(buf, &self.command_name);
        amf0::write_number(buf, self.transaction_id);
        amf0::write_null(buf);
    }
}

/// set_chunk_size protocol control (type 1)
#[derive(Debug, Clone)]
pub struct SetChunkSizePacket {
    pub chunk_size: u32,
}

impl SetChunkSizePacket {
    pub fn new(chunk_size: u32) -> Self {
        Self { chunk_size }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 4 {
            return Err(ProtocolError::MessageDecode("set_chunk_size too short".into()).into());
        }
        use bytes::Buf;
        // the most significant bit must be zero
        let chunk_size = buf.get_u32() & 0x7FFF_FFFF;
        Ok(Self { chunk_size })
    }

    fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u32(self.chunk_size);
    }
}

/// window_acknowledgement_size protocol control (type 5)
#[derive(Debug, Clone)]
pub struct SetWindowAckSizePacket {
    pub ack_window_size: u32,
}

impl SetWindowAckSizePacket {
    pub fn new(ack_window_size: u32) -> Self {
        Self { ack_window_size }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 4 {
            return Err(ProtocolError::MessageDecode("window_ack_size too short".into()).into());
        }
        use bytes::Buf;
        Ok(Self { ack_window_size: buf.get_u32() })
    }

    fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u32(self.ack_window_size);
    }
}

/// set_peer_bandwidth protocol control (type 6)
#[derive(Debug, Clone)]
pub struct SetPeerBandwidthPacket {
    pub bandwidth: u32,
    pub limit_type: u8,
}

impl SetPeerBandwidthPacket {
    pub fn dynamic(bandwidth: u32) -> Self {
        Self { bandwidth, limit_type: BANDWIDTH_LIMIT_DYNAMIC }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 5 {
            return Err(ProtocolError::MessageDecode("set_peer_bandwidth too short".into()).into());
        }
        use bytes::Buf;
        let bandwidth = buf.get_u32();
        let limit_type = buf.get_u8();
        Ok(Self { bandwidth, limit_type })
    }

    fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u32(self.bandwidth);
        buf.put_u8(self.limit_type);
    }
}

/// acknowledgement protocol control (type 3)
#[derive(Debug, Clone)]
pub struct AcknowledgementPacket {
    pub sequence_number: u32,
}

impl AcknowledgementPacket {
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 4 {
            return Err(ProtocolError::MessageDecode("acknowledgement too short".into()).into());
        }
        use bytes::Buf;
        Ok(Self { sequence_number: buf.get_u32() })
    }

    fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u32(self.sequence_number);
    }
}

/// user control message (type 4)
#[derive(Debug, Clone)]
pub struct UserControlPacket {
    pub event: UserControlEvent,
}

impl UserControlPacket {
    pub fn stream_begin(stream_id: u32) -> Self {
        Self { event: UserControlEvent::StreamBegin(stream_id) }
    }

    pub fn stream_eof(stream_id: u32) -> Self {
        Self { event: UserControlEvent::StreamEof(stream_id) }
    }

    pub fn ping_response(timestamp: u32) -> Self {
        Self { event: UserControlEvent::PingResponse(timestamp) }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        use bytes::Buf;
        if buf.len() < 6 {
            return Err(ProtocolError::MessageDecode("user control too short".into()).into());
        }

        let event_type = buf.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(buf.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(buf.get_u32()),
            UC_STREAM_DRY => UserControlEvent::StreamDry(buf.get_u32()),
            UC_SET_BUFFER_LENGTH => {
                if buf.len() < 8 {
                    return Err(
                        ProtocolError::MessageDecode("set_buffer_length too short".into()).into()
                    );
                }
                UserControlEvent::SetBufferLength {
                    stream_id: buf.get_u32(),
                    buffer_ms: buf.get_u32(),
                }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(buf.get_u32()),
            UC_PING_REQUEST => UserControlEvent::PingRequest(buf.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(buf.get_u32()),
            event_type => {
                warn!(event_type, "unknown user control event");
                UserControlEvent::Unknown { event_type, data: buf.clone() }
            }
        };

        Ok(Self { event })
    }

    fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        match &self.event {
            UserControlEvent::StreamBegin(id) => {
                buf.put_u16(UC_STREAM_BEGIN);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamEof(id) => {
                buf.put_u16(UC_STREAM_EOF);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamDry(id) => {
                buf.put_u16(UC_STREAM_DRY);
                buf.put_u32(*id);
            }
            UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
                buf.put_u16(UC_SET_BUFFER_LENGTH);
                buf.put_u32(*stream_id);
                buf.put_u32(*buffer_ms);
            }
            UserControlEvent::StreamIsRecorded(id) => {
                buf.put_u16(UC_STREAM_IS_RECORDED);
                buf.put_u32(*id);
            }
            UserControlEvent::PingRequest(ts) => {
                buf.put_u16(UC_PING_REQUEST);
                buf.put_u32(*ts);
            }
            UserControlEvent::PingResponse(ts) => {
                buf.put_u16(UC_PING_RESPONSE);
                buf.put_u32(*ts);
            }
            UserControlEvent::Unknown { event_type, data } => {
                buf.put_u16(*event_type);
                buf.put_slice(data);
            }
        }
    }
}
