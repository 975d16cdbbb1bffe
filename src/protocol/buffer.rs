//! Growable receive buffer over an async byte reader
//!
//! Chunk parsing wants "at least n bytes, then parse in place". The buffer
//! pulls from the socket inside [`ReadBuffer::require`], which is the one
//! suspension point of the whole inbound path, and hands out in-place
//! big-endian readers afterwards. Live bytes are compacted to offset 0 only
//! when the free tail can no longer satisfy the pending require, not on
//! every read.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::{DEFAULT_RECV_BUFFER_SIZE, MAX_RECV_BUFFER_SIZE};

/// Growable buffer fronting a socket reader
pub struct ReadBuffer<R> {
    reader: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// Running count of bytes pulled off the reader, for the ack window
    total_read: u64,
}

impl<R: AsyncRead + Unpin> ReadBuffer<R> {
    /// Create a buffer with the default 128 KiB capacity
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; DEFAULT_RECV_BUFFER_SIZE],
            start: 0,
            end: 0,
            total_read: 0,
        }
    }

    /// Readable bytes currently buffered
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True when no readable bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total bytes ever read from the underlying reader
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Grow the buffer capacity; never shrinks, capped at 256 KiB.
    pub fn set_capacity(&mut self, capacity: usize) {
        let capacity = capacity.min(MAX_RECV_BUFFER_SIZE);
        if capacity <= self.buf.len() {
            return;
        }
        self.buf.resize(capacity, 0);
    }

    /// Ensure at least `required` readable bytes, pulling from the reader
    /// as needed.
    ///
    /// Fails with `BufferOverflow` when the requirement cannot fit within
    /// capacity (a framing bug, not EOF) and with `ConnectionClosed` when
    /// the reader hits EOF first.
    pub async fn require(&mut self, required: usize) -> Result<()> {
        if self.len() >= required {
            return Ok(());
        }

        if self.buf.len() - self.end < required - self.len() {
            // not enough tail space: compact, then re-check against capacity
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }

            if self.buf.len() - self.end < required - self.len() {
                return Err(ProtocolError::BufferOverflow {
                    required,
                    capacity: self.buf.len(),
                }
                .into());
            }
        }

        while self.len() < required {
            let nread = self.reader.read(&mut self.buf[self.end..]).await?;
            if nread == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.end += nread;
            self.total_read += nread as u64;
        }

        Ok(())
    }

    /// Return a view of the next `n` readable bytes and advance past them.
    ///
    /// Callers must have satisfied a `require(n)` first.
    pub fn read_slice(&mut self, n: usize) -> &[u8] {
        debug_assert!(self.len() >= n);
        let start = self.start;
        self.start += n;
        &self.buf[start..start + n]
    }

    /// Move the read cursor by `delta`; negative values rewind, bounded by
    /// the buffer start.
    pub fn skip(&mut self, delta: isize) {
        let cursor = self.start as isize + delta;
        debug_assert!(cursor >= 0 && cursor <= self.end as isize);
        self.start = cursor.max(0) as usize;
    }

    pub fn read_u8(&mut self) -> u8 {
        debug_assert!(self.len() >= 1);
        let v = self.buf[self.start];
        self.start += 1;
        v
    }

    pub fn read_u16(&mut self) -> u16 {
        let s = self.read_slice(2);
        u16::from_be_bytes([s[0], s[1]])
    }

    pub fn read_u24(&mut self) -> u32 {
        let s = self.read_slice(3);
        ((s[0] as u32) << 16) | ((s[1] as u32) << 8) | (s[2] as u32)
    }

    pub fn read_u32(&mut self) -> u32 {
        let s = self.read_slice(4);
        u32::from_be_bytes([s[0], s[1], s[2], s[3]])
    }

    pub fn read_u32_le(&mut self) -> u32 {
        let s = self.read_slice(4);
        u32::from_le_bytes([s[0], s[1], s[2], s[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn buffer_over(data: &[u8]) -> ReadBuffer<Cursor<Vec<u8>>> {
        ReadBuffer::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_big_endian_readers() {
        let mut buf = buffer_over(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);

        buf.require(10).await.unwrap();
        assert_eq!(buf.read_u8(), 0x01);
        assert_eq!(buf.read_u16(), 0x0203);
        assert_eq!(buf.read_u24(), 0x040506);
        assert_eq!(buf.read_u32(), 0x0708090A);
        assert!(buf.is_empty());
        assert_eq!(buf.total_read(), 10);
    }

    #[tokio::test]
    async fn test_skip_rewind() {
        let mut buf = buffer_over(&[0xAA, 0xBB, 0xCC, 0xDD]);

        buf.require(4).await.unwrap();
        assert_eq!(buf.read_u32(), 0xAABBCCDD);
        buf.skip(-4);
        assert_eq!(buf.read_u8(), 0xAA);
        buf.skip(1);
        assert_eq!(buf.read_u8(), 0xCC);
    }

    #[tokio::test]
    async fn test_eof_is_client_closed() {
        let mut buf = buffer_over(&[0x01]);

        buf.require(1).await.unwrap();
        let err = buf.require(2).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_overflow_when_require_exceeds_capacity() {
        let mut buf = buffer_over(&[0u8; 64]);
        // capacity is capped below the requirement
        let err = buf.require(MAX_RECV_BUFFER_SIZE + 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::BufferOverflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_capacity_never_shrinks() {
        let mut buf = buffer_over(&[]);
        buf.set_capacity(16);
        assert_eq!(buf.buf.len(), DEFAULT_RECV_BUFFER_SIZE);

        buf.set_capacity(MAX_RECV_BUFFER_SIZE * 2);
        assert_eq!(buf.buf.len(), MAX_RECV_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_compaction_preserves_live_bytes() {
        // fill the whole buffer, consume all but 4 bytes, then require more
        // than the (empty) tail can hold so the live bytes must move
        let mut data = vec![0u8; DEFAULT_RECV_BUFFER_SIZE];
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut buf = buffer_over(&data);

        buf.require(DEFAULT_RECV_BUFFER_SIZE).await.unwrap();
        buf.read_slice(DEFAULT_RECV_BUFFER_SIZE - 4);

        buf.require(8).await.unwrap();
        buf.read_slice(4); // the compacted live zeros
        assert_eq!(buf.read_u32(), 0xDEADBEEF);
    }
}
