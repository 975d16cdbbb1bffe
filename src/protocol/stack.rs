//! Protocol engine: message receive/send over the chunk codec
//!
//! The engine is split along the tokio ownership seam. [`MessageReader`]
//! owns the socket's read half, the receive buffer and the per-cid
//! reassembly table; [`MessageWriter`] owns the write half, the chunk
//! encoder and the outbound transaction table. The two halves share an
//! [`AckWindow`], so whichever loop currently holds the writer can emit the
//! acknowledgement the reader's byte count made due.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::buffer::ReadBuffer;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::message::{MessageHeader, RtmpMessage};
use crate::protocol::packet::{Packet, Transactions};

/// Inbound acknowledgement accounting, shared by reader and writer loops
#[derive(Debug, Default)]
pub struct AckWindow {
    /// Window size the peer asked for; 0 until its window_ack_size arrives
    window: AtomicU32,
    /// Bytes received from the socket
    received: AtomicU64,
    /// Bytes already acknowledged
    acked: AtomicU64,
}

impl AckWindow {
    pub fn set_window(&self, window: u32) {
        self.window.store(window, Ordering::Relaxed);
    }

    fn update_received(&self, received: u64) {
        self.received.store(received, Ordering::Relaxed);
    }

    /// Sequence number to acknowledge, once a full window has arrived
    /// since the last ack.
    pub fn take_due(&self) -> Option<u32> {
        let window = self.window.load(Ordering::Relaxed) as u64;
        if window == 0 {
            return None;
        }

        let received = self.received.load(Ordering::Relaxed);
        let acked = self.acked.load(Ordering::Relaxed);
        if received.saturating_sub(acked) < window {
            return None;
        }

        self.acked.store(received, Ordering::Relaxed);
        Some(received as u32)
    }
}

/// Receiving half of the protocol engine
pub struct MessageReader<R> {
    buffer: ReadBuffer<R>,
    decoder: ChunkDecoder,
    transactions: Arc<Transactions>,
    ack: Arc<AckWindow>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, transactions: Arc<Transactions>) -> Self {
        Self {
            buffer: ReadBuffer::new(reader),
            decoder: ChunkDecoder::new(),
            transactions,
            ack: Arc::new(AckWindow::default()),
        }
    }

    /// Shared ack accounting for whichever loop holds the writer
    pub fn ack_window(&self) -> Arc<AckWindow> {
        Arc::clone(&self.ack)
    }

    /// Mutable access to the receive buffer (handshake runs before chunking)
    pub fn buffer(&mut self) -> &mut ReadBuffer<R> {
        &mut self.buffer
    }

    /// Grow the user-space receive buffer (merged read on the publish path)
    pub fn set_recv_buffer(&mut self, size: usize) {
        self.buffer.set_capacity(size);
    }

    /// Current inbound chunk size
    pub fn in_chunk_size(&self) -> u32 {
        self.decoder.chunk_size()
    }

    /// Receive the next complete, non-empty message.
    ///
    /// Control messages update engine state on the way through and are then
    /// returned to the caller like any other message.
    pub async fn recv_message(&mut self) -> Result<RtmpMessage> {
        loop {
            let msg = loop {
                if let Some(msg) = self.decoder.read_chunk(&mut self.buffer).await? {
                    break msg;
                }
            };

            self.ack.update_received(self.buffer.total_read());

            if msg.is_empty() {
                warn!(
                    message_type = msg.header.message_type,
                    "got empty message, drop it"
                );
                continue;
            }

            self.on_recv_message(&msg)?;
            return Ok(msg);
        }
    }

    /// Engine-state side effects of a received message
    fn on_recv_message(&mut self, msg: &RtmpMessage) -> Result<()> {
        match msg.header.message_type {
            MSG_SET_CHUNK_SIZE => {
                let packet = match Packet::decode(msg, &self.transactions)? {
                    Packet::SetChunkSize(p) => p,
                    _ => unreachable!("type 1 decodes to SetChunkSize"),
                };

                let mut chunk_size = packet.chunk_size;
                if chunk_size < MIN_CHUNK_SIZE {
                    return Err(ProtocolError::ChunkStart(format!(
                        "chunk size must be at least {}, got {}",
                        MIN_CHUNK_SIZE, chunk_size
                    ))
                    .into());
                }
                if chunk_size > MAX_CHUNK_SIZE {
                    warn!(chunk_size, "clamp oversized chunk size to {}", MAX_CHUNK_SIZE);
                    chunk_size = MAX_CHUNK_SIZE;
                }

                debug!(chunk_size, "peer set chunk size");
                self.decoder.set_chunk_size(chunk_size);
            }
            MSG_WINDOW_ACK_SIZE => {
                if let Packet::SetWindowAckSize(p) = Packet::decode(msg, &self.transactions)? {
                    debug!(window = p.ack_window_size, "peer set ack window");
                    self.ack.set_window(p.ack_window_size);
                }
            }
            MSG_USER_CONTROL => {
                // decoded here for validation; replies are the caller's job
                Packet::decode(msg, &self.transactions)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Sending half of the protocol engine
pub struct MessageWriter<W> {
    writer: W,
    encoder: ChunkEncoder,
    transactions: Arc<Transactions>,
    /// Window we asked the peer to ack at (recorded from set_window_ack_size)
    out_ack_window: u32,
    /// Reused chunk-encoding scratch buffer
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W, transactions: Arc<Transactions>) -> Self {
        Self {
            writer,
            encoder: ChunkEncoder::new(),
            transactions,
            out_ack_window: 0,
            scratch: BytesMut::with_capacity(4096),
        }
    }

    /// Raw writer access; the handshake runs before chunking starts
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Current outbound chunk size
    pub fn out_chunk_size(&self) -> u32 {
        self.encoder.chunk_size()
    }

    /// Window size we advertised to the peer
    pub fn out_ack_window(&self) -> u32 {
        self.out_ack_window
    }

    /// Encode and send one packet on the given message stream.
    pub async fn send_packet(&mut self, packet: &Packet, stream_id: u32) -> Result<()> {
        let payload = packet.encode_payload()?;
        if payload.is_empty() {
            warn!("packet encoded empty, ignore it");
            return Ok(());
        }

        let mut header = MessageHeader::default();
        header.payload_length = payload.len() as u32;
        header.message_type = packet.message_type();
        header.prefer_cid = packet.prefer_cid();
        header.stream_id = stream_id;

        self.scratch.clear();
        self.encoder.encode(&header, &payload, &mut self.scratch);
        self.writer.write_all(&self.scratch).await?;
        self.writer.flush().await?;

        self.on_send_packet(packet);
        Ok(())
    }

    /// Send a batch of media messages with a single flush (merged write).
    pub async fn send_messages(&mut self, msgs: &[RtmpMessage], stream_id: u32) -> Result<()> {
        self.scratch.clear();

        for msg in msgs {
            if msg.is_empty() {
                continue;
            }
            let mut header = msg.header;
            header.stream_id = stream_id;
            self.encoder.encode(&header, &msg.payload, &mut self.scratch);
        }

        if self.scratch.is_empty() {
            return Ok(());
        }

        self.writer.write_all(&self.scratch).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Emit an acknowledgement if the reader's byte count made one due.
    pub async fn respond_ack(&mut self, ack: &AckWindow) -> Result<()> {
        if let Some(sequence) = ack.take_due() {
            let packet = Packet::Acknowledgement(
                crate::protocol::packet::AcknowledgementPacket::new(sequence),
            );
            self.send_packet(&packet, 0).await?;
        }
        Ok(())
    }

    /// Engine-state side effects of a sent packet
    fn on_send_packet(&mut self, packet: &Packet) {
        match packet {
            Packet::SetWindowAckSize(p) => {
                self.out_ack_window = p.ack_window_size;
            }
            Packet::SetChunkSize(p) => {
                self.encoder.set_chunk_size(p.chunk_size);
            }
            _ => {
                if let Some((transaction_id, command)) = packet.expects_response() {
                    self.transactions.record(transaction_id, command);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::packet::{
        PublishPacket, SetChunkSizePacket, SetWindowAckSizePacket, UserControlPacket,
    };
    use bytes::Bytes;
    use std::io::Cursor;

    fn reader_over(data: Vec<u8>) -> MessageReader<Cursor<Vec<u8>>> {
        MessageReader::new(Cursor::new(data), Arc::new(Transactions::new()))
    }

    fn encode_packet(packet: &Packet, chunk_size: u32) -> Vec<u8> {
        let payload = packet.encode_payload().unwrap();
        let mut header = MessageHeader::default();
        header.payload_length = payload.len() as u32;
        header.message_type = packet.message_type();
        header.prefer_cid = packet.prefer_cid();

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(chunk_size);
        let mut out = BytesMut::new();
        encoder.encode(&header, &payload, &mut out);
        out.to_vec()
    }

    #[tokio::test]
    async fn test_set_chunk_size_applies_to_following_reads() {
        // set_chunk_size(4096), then a 4096-byte video payload in one chunk
        let mut data = encode_packet(
            &Packet::SetChunkSize(SetChunkSizePacket::new(4096)),
            DEFAULT_CHUNK_SIZE,
        );

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let header = MessageHeader::video(payload.len() as u32, 0, 1);
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(4096);
        let mut wire = BytesMut::new();
        encoder.encode(&header, &payload, &mut wire);
        data.extend_from_slice(&wire);

        let mut reader = reader_over(data);

        let msg = reader.recv_message().await.unwrap();
        assert!(msg.header.is_set_chunk_size());
        assert_eq!(reader.in_chunk_size(), 4096);

        let msg = reader.recv_message().await.unwrap();
        assert!(msg.header.is_video());
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_undersized_chunk_size_rejected() {
        let data = encode_packet(
            &Packet::SetChunkSize(SetChunkSizePacket::new(64)),
            DEFAULT_CHUNK_SIZE,
        );
        let mut reader = reader_over(data);

        let err = reader.recv_message().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ChunkStart(_))));
    }

    #[tokio::test]
    async fn test_oversized_chunk_size_clamped() {
        let data = encode_packet(
            &Packet::SetChunkSize(SetChunkSizePacket::new(1_000_000)),
            DEFAULT_CHUNK_SIZE,
        );
        let mut reader = reader_over(data);

        reader.recv_message().await.unwrap();
        assert_eq!(reader.in_chunk_size(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_window_ack_size_arms_ack_window() {
        let mut data = encode_packet(
            &Packet::SetWindowAckSize(SetWindowAckSizePacket::new(64)),
            DEFAULT_CHUNK_SIZE,
        );
        // enough traffic afterwards to cross the 64-byte window
        data.extend_from_slice(&encode_packet(
            &Packet::UserControl(UserControlPacket::stream_begin(1)),
            DEFAULT_CHUNK_SIZE,
        ));
        data.extend_from_slice(&encode_packet(
            &Packet::UserControl(UserControlPacket::stream_begin(2)),
            DEFAULT_CHUNK_SIZE,
        ));
        data.extend_from_slice(&encode_packet(
            &Packet::UserControl(UserControlPacket::stream_begin(3)),
            DEFAULT_CHUNK_SIZE,
        ));

        let mut reader = reader_over(data);
        let ack = reader.ack_window();
        assert!(ack.take_due().is_none(), "window not armed yet");

        for _ in 0..4 {
            reader.recv_message().await.unwrap();
        }

        let due = ack.take_due().expect("a window of bytes arrived");
        assert!(due as u64 >= 64);
        // a second take without new traffic is not due
        assert!(ack.take_due().is_none());
    }

    #[tokio::test]
    async fn test_writer_records_request_transactions() {
        let transactions = Arc::new(Transactions::new());
        let (client, _server) = tokio::io::duplex(16 * 1024);
        let (_rd, wr) = tokio::io::split(client);
        let mut writer = MessageWriter::new(wr, Arc::clone(&transactions));

        let packet = Packet::FmleStart(crate::protocol::packet::FmleStartPacket {
            command_name: CMD_RELEASE_STREAM.to_string(),
            transaction_id: 9.0,
            stream_name: "cam01".into(),
        });
        writer.send_packet(&packet, 0).await.unwrap();

        // a _result for transaction 9 now resolves through the table
        let res = Packet::FmleStartRes(crate::protocol::packet::FmleStartResPacket::new(9.0));
        let payload = res.encode_payload().unwrap();
        let mut header = MessageHeader::default();
        header.message_type = MSG_COMMAND_AMF0;
        header.payload_length = payload.len() as u32;
        let msg = RtmpMessage::new(header, payload);
        assert!(Packet::decode(&msg, &transactions).is_ok());
    }

    #[tokio::test]
    async fn test_writer_roundtrip_to_reader() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_crd, cwr) = tokio::io::split(client);
        let (srd, _swr) = tokio::io::split(server);

        let transactions = Arc::new(Transactions::new());
        let mut writer = MessageWriter::new(cwr, Arc::clone(&transactions));
        let mut reader = MessageReader::new(srd, transactions);

        writer
            .send_packet(
                &Packet::Publish(PublishPacket {
                    transaction_id: 5.0,
                    stream_name: "cam01".into(),
                    publish_type: "live".into(),
                }),
                1,
            )
            .await
            .unwrap();

        let media = RtmpMessage::new(
            MessageHeader::audio(4, 40, 1),
            Bytes::from_static(&[0xAF, 0x01, 0x00, 0x00]),
        );
        writer.send_messages(&[media], 1).await.unwrap();

        let msg = reader.recv_message().await.unwrap();
        assert!(msg.header.is_amf0_command());
        assert_eq!(msg.header.stream_id, 1);

        let msg = reader.recv_message().await.unwrap();
        assert!(msg.header.is_audio());
        assert_eq!(msg.header.timestamp, 40);
    }
}
