//! RTMP chunk stream codec
//!
//! Messages are split into chunks for multiplexing. Each chunk carries a
//! basic header naming its chunk stream (cid) and a message header whose
//! size depends on the 2-bit fmt field; omitted fields inherit from the
//! previous chunk on the same cid.
//!
//! ```text
//! Chunk layout:
//! +--------------+-----------------+------------------+------------+
//! | Basic Header | Message Header  | Extended Ts      | Chunk Data |
//! | (1-3 bytes)  | (0,3,7,11 bytes)| (0 or 4 bytes)   | (variable) |
//! +--------------+-----------------+------------------+------------+
//!
//! Basic header: fmt(2 bits) + cid(6 bits)
//! - cid 2-63:    literal, 1 byte total
//! - cid 0:       64 + next byte (64-319), 2 bytes
//! - cid 1:       64 + next + 256*next (64-65599), 3 bytes
//!
//! Message header by fmt:
//! - 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - 2 (3 bytes):  timestamp_delta(3)
//! - 3 (0 bytes):  everything inherited
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::warn;

use crate::error::{ProtocolError, Result};
use crate::protocol::buffer::ReadBuffer;
use crate::protocol::constants::*;
use crate::protocol::message::{MessageHeader, RtmpMessage};

/// Per-cid reassembly state
#[derive(Debug)]
struct ChunkStream {
    cid: u32,
    /// Last header observed on this cid; omitted fields inherit from it
    header: MessageHeader,
    /// Whether the current message uses the extended timestamp field
    extended_timestamp: bool,
    /// Partial payload of the in-progress message, if any
    partial: Option<BytesMut>,
    /// Messages completed on this cid so far
    msg_count: u64,
}

impl ChunkStream {
    fn new(cid: u32) -> Self {
        let mut header = MessageHeader::default();
        header.prefer_cid = cid;
        Self {
            cid,
            header,
            extended_timestamp: false,
            partial: None,
            msg_count: 0,
        }
    }
}

/// Chunk stream decoder: demultiplexes chunks and reassembles messages
pub struct ChunkDecoder {
    /// Chunk streams with cid 0..63; the common case avoids the map
    cache: Vec<ChunkStream>,
    /// Chunk streams with larger cids
    streams: HashMap<u32, ChunkStream>,
    in_chunk_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        let cache = (0..CHUNK_STREAM_CACHE as u32).map(ChunkStream::new).collect();
        Self {
            cache,
            streams: HashMap::new(),
            in_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Current inbound chunk size
    pub fn chunk_size(&self) -> u32 {
        self.in_chunk_size
    }

    /// Apply a peer's set_chunk_size (already range-validated)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.in_chunk_size = size;
    }

    /// Read exactly one chunk; returns a message when it completed one.
    pub async fn read_chunk<R: AsyncRead + Unpin>(
        &mut self,
        buf: &mut ReadBuffer<R>,
    ) -> Result<Option<RtmpMessage>> {
        let (fmt, cid) = read_basic_header(buf).await?;

        let cs = if (cid as usize) < CHUNK_STREAM_CACHE {
            &mut self.cache[cid as usize]
        } else {
            self.streams.entry(cid).or_insert_with(|| ChunkStream::new(cid))
        };

        read_message_header(buf, cs, fmt).await?;
        read_message_payload(buf, cs, self.in_chunk_size).await
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the 1-3 byte basic header into (fmt, cid)
async fn read_basic_header<R: AsyncRead + Unpin>(buf: &mut ReadBuffer<R>) -> Result<(u8, u32)> {
    buf.require(1).await?;

    // 0 1 2 3 4 5 6 7
    // +-+-+-+-+-+-+-+-+
    // |fmt|   cs id   |
    // +-+-+-+-+-+-+-+-+
    let first = buf.read_u8();
    let fmt = (first >> 6) & 0x03;
    let cid = (first & 0x3F) as u32;

    match cid {
        0 => {
            buf.require(1).await?;
            Ok((fmt, 64 + buf.read_u8() as u32))
        }
        1 => {
            buf.require(2).await?;
            let second = buf.read_u8() as u32;
            let third = buf.read_u8() as u32;
            Ok((fmt, 64 + second + third * 256))
        }
        _ => Ok((fmt, cid)),
    }
}

/// Parse the fmt-dependent message header, applying the inheritance rules
async fn read_message_header<R: AsyncRead + Unpin>(
    buf: &mut ReadBuffer<R>,
    cs: &mut ChunkStream,
    fmt: u8,
) -> Result<()> {
    let is_first_chunk_of_msg = cs.partial.is_none();

    if cs.msg_count == 0 && fmt != FMT_TYPE0 {
        // librtmp pings a fresh cid=2 with fmt=1; accept that one shape
        if cs.cid == CID_PROTOCOL_CONTROL && fmt == FMT_TYPE1 {
            warn!("accept cid=2, fmt=1 to make librtmp happy");
        } else {
            return Err(ProtocolError::ChunkStart(format!(
                "fresh chunk stream must start with fmt=0, got fmt={} cid={}",
                fmt, cs.cid
            ))
            .into());
        }
    }

    if cs.partial.is_some() && fmt == FMT_TYPE0 {
        return Err(ProtocolError::ChunkStart(format!(
            "fmt=0 while a message is in progress, cid={}",
            cs.cid
        ))
        .into());
    }

    let mh_size = match fmt {
        FMT_TYPE0 => 11,
        FMT_TYPE1 => 7,
        FMT_TYPE2 => 3,
        _ => 0,
    };
    if mh_size > 0 {
        buf.require(mh_size).await?;
    }

    if fmt <= FMT_TYPE2 {
        cs.header.timestamp_delta = buf.read_u24();
        cs.extended_timestamp = cs.header.timestamp_delta >= EXTENDED_TIMESTAMP;

        if !cs.extended_timestamp {
            if fmt == FMT_TYPE0 {
                cs.header.timestamp = cs.header.timestamp_delta as i64;
            } else {
                cs.header.timestamp += cs.header.timestamp_delta as i64;
            }
        }

        if fmt <= FMT_TYPE1 {
            let payload_length = buf.read_u24();

            if !is_first_chunk_of_msg && cs.header.payload_length != payload_length {
                return Err(ProtocolError::ChunkStart(format!(
                    "payload length changed mid-message: {} -> {}, cid={}",
                    cs.header.payload_length, payload_length, cs.cid
                ))
                .into());
            }

            cs.header.payload_length = payload_length;
            cs.header.message_type = buf.read_u8();

            if fmt == FMT_TYPE0 {
                // the stream id field is little-endian on the wire
                cs.header.stream_id = buf.read_u32_le();
            }
        }
    } else if is_first_chunk_of_msg && !cs.extended_timestamp {
        // fmt=3 opening the next message: reuse the stored delta
        cs.header.timestamp += cs.header.timestamp_delta as i64;
    }

    if cs.extended_timestamp {
        buf.require(4).await?;
        let timestamp = buf.read_u32() & 0x7FFF_FFFF;
        let chunk_timestamp = cs.header.timestamp as u32;

        // Continuation chunks may omit the 4 extended-timestamp bytes.
        // Peek: if the field does not equal the known chunk timestamp,
        // those bytes belong to the payload, so rewind.
        if !is_first_chunk_of_msg && chunk_timestamp > 0 && chunk_timestamp != timestamp {
            buf.skip(-4);
            warn!("no 4B extended timestamp in the continue chunk");
        } else {
            cs.header.timestamp = timestamp as i64;
        }
    }

    cs.header.timestamp &= TIMESTAMP_MASK;

    if cs.partial.is_none() {
        cs.partial = Some(BytesMut::with_capacity(cs.header.payload_length as usize));
    }
    cs.msg_count += 1;

    Ok(())
}

/// Read one chunk's worth of payload; returns the message when complete
async fn read_message_payload<R: AsyncRead + Unpin>(
    buf: &mut ReadBuffer<R>,
    cs: &mut ChunkStream,
    in_chunk_size: u32,
) -> Result<Option<RtmpMessage>> {
    if cs.header.payload_length == 0 {
        // empty message: complete immediately, the recv loop discards it
        cs.partial = None;
        return Ok(Some(RtmpMessage::new(cs.header, Bytes::new())));
    }

    let partial = cs.partial.as_mut().expect("in-progress message");
    let remaining = cs.header.payload_length as usize - partial.len();
    let payload_size = remaining.min(in_chunk_size as usize);

    buf.require(payload_size).await?;
    partial.put_slice(buf.read_slice(payload_size));

    if partial.len() == cs.header.payload_length as usize {
        let payload = cs.partial.take().expect("in-progress message").freeze();
        return Ok(Some(RtmpMessage::new(cs.header, payload)));
    }

    Ok(None)
}

/// Chunk stream encoder: splits messages into fmt0 + fmt3 chunk runs
pub struct ChunkEncoder {
    out_chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self { out_chunk_size: DEFAULT_CHUNK_SIZE }
    }

    /// Current outbound chunk size
    pub fn chunk_size(&self) -> u32 {
        self.out_chunk_size
    }

    /// Switch the outbound chunk size (after pushing set_chunk_size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.out_chunk_size = size;
    }

    /// Append the chunked encoding of one message to `out`
    pub fn encode(&self, header: &MessageHeader, payload: &[u8], out: &mut BytesMut) {
        let timestamp = (header.timestamp & TIMESTAMP_MASK) as u32;
        let extended = timestamp >= EXTENDED_TIMESTAMP;

        let mut offset = 0;
        let mut first_chunk = true;

        while offset < payload.len() {
            if first_chunk {
                write_basic_header(FMT_TYPE0, header.prefer_cid, out);

                if extended {
                    put_u24(out, EXTENDED_TIMESTAMP);
                } else {
                    put_u24(out, timestamp);
                }
                put_u24(out, header.payload_length);
                out.put_u8(header.message_type);
                out.put_u32_le(header.stream_id);
            } else {
                write_basic_header(FMT_TYPE3, header.prefer_cid, out);
            }

            // extended timestamp repeats on every chunk of the message
            if extended {
                out.put_u32(timestamp);
            }

            let chunk_len = (payload.len() - offset).min(self.out_chunk_size as usize);
            out.put_slice(&payload[offset..offset + chunk_len]);
            offset += chunk_len;
            first_chunk = false;
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(fmt: u8, cid: u32, out: &mut BytesMut) {
    if cid >= 64 + 256 {
        out.put_u8((fmt << 6) | 1);
        let rest = cid - 64;
        out.put_u8((rest & 0xFF) as u8);
        out.put_u8(((rest >> 8) & 0xFF) as u8);
    } else if cid >= 64 {
        out.put_u8(fmt << 6);
        out.put_u8((cid - 64) as u8);
    } else {
        out.put_u8((fmt << 6) | cid as u8);
    }
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8(((value >> 16) & 0xFF) as u8);
    out.put_u8(((value >> 8) & 0xFF) as u8);
    out.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Cursor;

    fn buffer_over(data: Vec<u8>) -> ReadBuffer<Cursor<Vec<u8>>> {
        ReadBuffer::new(Cursor::new(data))
    }

    async fn decode_all(data: Vec<u8>, in_chunk_size: u32) -> Vec<RtmpMessage> {
        let mut buf = buffer_over(data);
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(in_chunk_size);

        let mut messages = Vec::new();
        loop {
            match decoder.read_chunk(&mut buf).await {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => continue,
                Err(Error::ConnectionClosed) => break,
                Err(e) => panic!("decode failed: {}", e),
            }
        }
        messages
    }

    /// fmt0 chunk on cid 3 carrying the whole payload
    fn fmt0_chunk(ts: u32, type_id: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x03];
        out.extend_from_slice(&[(ts >> 16) as u8, (ts >> 8) as u8, ts as u8]);
        let len = payload.len() as u32;
        out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        out.push(type_id);
        out.extend_from_slice(&stream_id.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_single_chunk_message() {
        let payload = b"hello rtmp".to_vec();
        let msgs = decode_all(fmt0_chunk(1000, MSG_COMMAND_AMF0, 1, &payload), 128).await;

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.timestamp, 1000);
        assert_eq!(msgs[0].header.message_type, MSG_COMMAND_AMF0);
        assert_eq!(msgs[0].header.stream_id, 1);
        assert_eq!(&msgs[0].payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_multi_chunk_reassembly() {
        // 300-byte payload with 128-byte chunks: fmt0 + two fmt3 continuations
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut data = vec![0x04]; // fmt=0, cid=4
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&[0, 0x01, 0x2C]); // length 300
        data.push(MSG_VIDEO);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&payload[..128]);
        data.push(0xC4); // fmt=3, cid=4
        data.extend_from_slice(&payload[128..256]);
        data.push(0xC4);
        data.extend_from_slice(&payload[256..]);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 1);
        // concatenation of chunk payloads in arrival order equals the message
        assert_eq!(&msgs[0].payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_fmt_inheritance() {
        // fmt0 establishes (ts=100, len=4, type=8, sid=1); fmt1 changes the
        // delta and type; fmt2 changes only the delta; fmt3 inherits all
        let mut data = fmt0_chunk(100, MSG_AUDIO, 1, &[1, 2, 3, 4]);

        // fmt1: delta=50, len=4, type=9
        data.push(0x43); // fmt=1, cid=3
        data.extend_from_slice(&[0, 0, 50]);
        data.extend_from_slice(&[0, 0, 4]);
        data.push(MSG_VIDEO);
        data.extend_from_slice(&[5, 6, 7, 8]);

        // fmt2: delta=25
        data.push(0x83); // fmt=2, cid=3
        data.extend_from_slice(&[0, 0, 25]);
        data.extend_from_slice(&[9, 10, 11, 12]);

        // fmt3: inherits delta=25 too
        data.push(0xC3);
        data.extend_from_slice(&[13, 14, 15, 16]);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].header.timestamp, 100);
        assert_eq!(msgs[1].header.timestamp, 150);
        assert_eq!(msgs[1].header.message_type, MSG_VIDEO);
        assert_eq!(msgs[1].header.stream_id, 1); // inherited from fmt0
        assert_eq!(msgs[2].header.timestamp, 175);
        assert_eq!(msgs[2].header.message_type, MSG_VIDEO);
        assert_eq!(msgs[3].header.timestamp, 200);
        assert_eq!(&msgs[3].payload[..], &[13, 14, 15, 16]);
    }

    #[tokio::test]
    async fn test_interleaved_chunk_streams() {
        let a: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let b = b"audio".to_vec();

        // video starts on cid 6, audio completes on cid 7 in between
        let mut data = vec![0x06];
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&[0, 0, 200]);
        data.push(MSG_VIDEO);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&a[..128]);

        data.extend_from_slice(&fmt0_chunk(10, MSG_AUDIO, 1, &b)[..]);
        // rewrite that chunk's cid from 3 to 7
        let audio_at = 12 + 128;
        data[audio_at] = 0x07;

        data.push(0xC6);
        data.extend_from_slice(&a[128..]);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].header.is_audio());
        assert!(msgs[1].header.is_video());
        assert_eq!(&msgs[1].payload[..], &a[..]);
    }

    #[tokio::test]
    async fn test_fresh_stream_requires_fmt0() {
        let mut data = vec![0x43]; // fmt=1 on fresh cid=3
        data.extend_from_slice(&[0, 0, 0, 0, 0, 1, MSG_AUDIO, 0xFF]);

        let mut buf = buffer_over(data);
        let mut decoder = ChunkDecoder::new();
        let err = decoder.read_chunk(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ChunkStart(_))));
    }

    #[tokio::test]
    async fn test_librtmp_ping_exception() {
        // fmt=1 on fresh cid=2 is tolerated (librtmp ping)
        let mut data = vec![0x42];
        data.extend_from_slice(&[0, 0, 0]); // delta
        data.extend_from_slice(&[0, 0, 6]); // length
        data.push(MSG_USER_CONTROL);
        data.extend_from_slice(&[0, 6, 0, 0, 0x0d, 0x0f]);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].header.is_user_control());
    }

    #[tokio::test]
    async fn test_length_change_mid_message_rejected() {
        let payload: Vec<u8> = vec![0u8; 128];
        let mut data = vec![0x03];
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&[0, 0, 200]);
        data.push(MSG_VIDEO);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&payload);
        // fmt=1 continuation claiming a different length
        data.push(0x43);
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&[0, 0, 150]);
        data.push(MSG_VIDEO);

        let mut buf = buffer_over(data);
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.read_chunk(&mut buf).await.unwrap().is_none());
        let err = decoder.read_chunk(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ChunkStart(_))));
    }

    #[tokio::test]
    async fn test_extended_timestamp() {
        let ts: u32 = 0x0100_0000;
        let payload = [0xAB; 4];

        let mut data = vec![0x03];
        data.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0, 0, 4]);
        data.push(MSG_AUDIO);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&ts.to_be_bytes());
        data.extend_from_slice(&payload);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.timestamp, ts as i64);
    }

    #[tokio::test]
    async fn test_extended_timestamp_absent_on_continuation() {
        // 200-byte message with extended timestamp; the fmt3 continuation
        // does NOT repeat the 4 bytes, so the decoder must rewind its peek
        let ts: u32 = 0x0100_0000;
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

        let mut data = vec![0x03];
        data.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0, 0, 200]);
        data.push(MSG_VIDEO);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&ts.to_be_bytes());
        data.extend_from_slice(&payload[..128]);
        data.push(0xC3); // continuation without extended timestamp bytes
        data.extend_from_slice(&payload[128..]);

        let msgs = decode_all(data, 128).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.timestamp, ts as i64);
        assert_eq!(&msgs[0].payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_encode_decode_roundtrip() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let header = MessageHeader::video(payload.len() as u32, 123456, 1);

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(128);
        let mut wire = BytesMut::new();
        encoder.encode(&header, &payload, &mut wire);

        let msgs = decode_all(wire.to_vec(), 128).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.timestamp, 123456);
        assert_eq!(msgs[0].header.message_type, MSG_VIDEO);
        assert_eq!(&msgs[0].payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_encode_decode_roundtrip_extended_timestamp() {
        let payload: Vec<u8> = vec![0x5A; 300];
        let ts: i64 = 0x0200_0000;
        let header = MessageHeader::video(payload.len() as u32, ts, 1);

        let encoder = ChunkEncoder::new(); // 128-byte chunks
        let mut wire = BytesMut::new();
        encoder.encode(&header, &payload, &mut wire);

        let msgs = decode_all(wire.to_vec(), 128).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.timestamp, ts);
        assert_eq!(&msgs[0].payload[..], &payload[..]);
    }

    #[test]
    fn test_basic_header_encodings() {
        let mut out = BytesMut::new();
        write_basic_header(FMT_TYPE0, 3, &mut out);
        assert_eq!(&out[..], &[0x03]);

        let mut out = BytesMut::new();
        write_basic_header(FMT_TYPE3, 3, &mut out);
        assert_eq!(&out[..], &[0xC3]);

        let mut out = BytesMut::new();
        write_basic_header(FMT_TYPE0, 64, &mut out);
        assert_eq!(&out[..], &[0x00, 0x00]);

        let mut out = BytesMut::new();
        write_basic_header(FMT_TYPE0, 320, &mut out);
        assert_eq!(&out[..], &[0x01, 0x00, 0x01]);
    }
}
