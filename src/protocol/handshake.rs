//! RTMP handshake, server side
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 S1 S2 (1 + 1536*2 bytes) ---|
//!   |------- C2 (1536 bytes, ignored) ----->|
//! ```
//!
//! Plain (simple) handshake only: C0 must be 0x03, no HMAC digest, no FP9
//! key negotiation. S1 echoes C1's time field, S2 echoes C1 wholesale.
//!
//! Reference: RTMP Specification Section 5.2

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, HandshakeError, Result};
use crate::protocol::buffer::ReadBuffer;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Run the server side of the plain handshake over an accepted socket.
pub async fn serve<R, W>(buf: &mut ReadBuffer<R>, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // C0 + C1
    require(buf, 1 + HANDSHAKE_SIZE).await?;
    let version = buf.read_u8();
    if version != RTMP_VERSION {
        return Err(HandshakeError::PlainRequired(version).into());
    }

    let mut c1 = [0u8; HANDSHAKE_SIZE];
    c1.copy_from_slice(buf.read_slice(HANDSHAKE_SIZE));

    // S0 + S1 + S2
    let mut response = Vec::with_capacity(1 + HANDSHAKE_SIZE * 2);
    response.push(RTMP_VERSION);
    response.extend_from_slice(&make_s1(&c1));
    response.extend_from_slice(&c1);
    writer.write_all(&response).await?;
    writer.flush().await?;

    // C2: read and ignore
    require(buf, HANDSHAKE_SIZE).await?;
    buf.read_slice(HANDSHAKE_SIZE);

    Ok(())
}

async fn require<R: AsyncRead + Unpin>(buf: &mut ReadBuffer<R>, n: usize) -> Result<()> {
    buf.require(n).await.map_err(|e| {
        if e.is_gracefully_closed() {
            Error::Handshake(HandshakeError::UnexpectedEof)
        } else {
            e
        }
    })
}

/// S1: 4 bytes time, 4 bytes echo of C1's time, 1528 bytes random.
fn make_s1(c1: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut s1 = [0u8; HANDSHAKE_SIZE];

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    s1[0..4].copy_from_slice(&now.to_be_bytes());
    s1[4..8].copy_from_slice(&c1[0..4]);

    // the random field is not security-relevant; a seeded LCG is enough
    let mut seed = now as u64 ^ 0x5DEE_CE66D;
    for chunk in s1[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    s1
}
