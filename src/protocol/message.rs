//! RTMP message types
//!
//! A message is the logical unit above chunking: a header plus a payload,
//! transported as one or more chunks. [`RtmpMessage`] owns its payload as
//! [`Bytes`], so one publisher-produced frame can sit in every consumer
//! queue without copying; per-consumer timestamp rewrites mutate a cloned
//! header, never the shared payload.

use bytes::Bytes;

use crate::protocol::constants::*;

/// RTMP message header
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MessageHeader {
    /// 24-bit timestamp or delta from the chunk header
    pub timestamp_delta: u32,
    /// Payload length in bytes
    pub payload_length: u32,
    /// Message type id
    pub message_type: u8,
    /// Message stream id
    pub stream_id: u32,
    /// Absolute timestamp in milliseconds, masked to 31 bits on ingress
    pub timestamp: i64,
    /// Chunk stream id this message prefers on the wire
    pub prefer_cid: u32,
}

impl MessageHeader {
    pub fn is_audio(&self) -> bool {
        self.message_type == MSG_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == MSG_VIDEO
    }

    pub fn is_av(&self) -> bool {
        self.is_audio() || self.is_video()
    }

    pub fn is_amf0_command(&self) -> bool {
        self.message_type == MSG_COMMAND_AMF0
    }

    pub fn is_amf0_data(&self) -> bool {
        self.message_type == MSG_DATA_AMF0
    }

    pub fn is_amf3_command(&self) -> bool {
        self.message_type == MSG_COMMAND_AMF3
    }

    pub fn is_amf3_data(&self) -> bool {
        self.message_type == MSG_DATA_AMF3
    }

    pub fn is_set_chunk_size(&self) -> bool {
        self.message_type == MSG_SET_CHUNK_SIZE
    }

    pub fn is_window_ack_size(&self) -> bool {
        self.message_type == MSG_WINDOW_ACK_SIZE
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.message_type == MSG_ACKNOWLEDGEMENT
    }

    pub fn is_user_control(&self) -> bool {
        self.message_type == MSG_USER_CONTROL
    }

    pub fn is_aggregate(&self) -> bool {
        self.message_type == MSG_AGGREGATE
    }

    /// Header for an audio message on the audio chunk stream
    pub fn audio(size: u32, timestamp: i64, stream_id: u32) -> Self {
        Self {
            timestamp_delta: timestamp as u32,
            payload_length: size,
            message_type: MSG_AUDIO,
            stream_id,
            timestamp,
            prefer_cid: CID_AUDIO,
        }
    }

    /// Header for a video message on the video chunk stream
    pub fn video(size: u32, timestamp: i64, stream_id: u32) -> Self {
        Self {
            timestamp_delta: timestamp as u32,
            payload_length: size,
            message_type: MSG_VIDEO,
            stream_id,
            timestamp,
            prefer_cid: CID_VIDEO,
        }
    }

    /// Header for an AMF0 data message (onMetaData)
    pub fn amf0_data(size: u32, stream_id: u32) -> Self {
        Self {
            timestamp_delta: 0,
            payload_length: size,
            message_type: MSG_DATA_AMF0,
            stream_id,
            timestamp: 0,
            prefer_cid: CID_OVER_CONNECTION2,
        }
    }
}

/// A complete RTMP message with a shared, immutable payload
#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(header: MessageHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Rewrite the timestamp on this reader's view of the message
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.header.timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_predicates() {
        let h = MessageHeader::audio(128, 40, 1);
        assert!(h.is_audio() && h.is_av() && !h.is_video());
        assert_eq!(h.prefer_cid, CID_AUDIO);

        let h = MessageHeader::video(128, 40, 1);
        assert!(h.is_video() && h.is_av() && !h.is_audio());

        let h = MessageHeader::amf0_data(64, 1);
        assert!(h.is_amf0_data() && !h.is_av());
        assert_eq!(h.timestamp, 0);
    }

    #[test]
    fn test_clone_shares_payload() {
        let payload = Bytes::from(vec![0u8; 1024]);
        let msg = RtmpMessage::new(MessageHeader::video(1024, 0, 1), payload.clone());

        let mut copy = msg.clone();
        copy.set_timestamp(9999);

        // the clone's header is independent, the payload block is shared
        assert_eq!(msg.header.timestamp, 0);
        assert_eq!(copy.header.timestamp, 9999);
        assert_eq!(msg.payload.as_ptr(), copy.payload.as_ptr());
    }
}
