//! Tunnel envelope: `| rand_nu[8] | length[4 BE] | ciphertext[length] |`.
//!
//! The cipher is the keyed XOR stream the paired instance expects,
//! `cipher[i] = plain[i] ^ token[i % token.len()] ^ rand_nu[i % 8]` — an
//! obfuscation envelope, not a confidentiality guarantee. Confidentiality,
//! when required, comes from the TLS wrap around the tunnel.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Hard ceiling on a single frame's payload. Oversize lengths are rejected
/// before any allocation happens.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Read size per frame in [`encode_copy`] — frames mirror read boundaries so
/// backpressure stays responsive.
pub const COPY_CHUNK: usize = 32 * 1024;

/// One decoded envelope frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub rand_nu: [u8; 8],
    pub payload: Vec<u8>,
}

fn apply_keystream(buf: &mut [u8], token: &[u8], rand_nu: &[u8; 8]) {
    if token.is_empty() {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= rand_nu[i % 8];
        }
        return;
    }
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= token[i % token.len()] ^ rand_nu[i % 8];
    }
}

/// Read exactly one frame, retrying partial reads until the frame is complete
/// or the stream errors. A short header or body reports [`FrameError::Short`].
pub async fn read_full<R>(token: &[u8], r: &mut R) -> Result<Packet, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 12];
    r.read_exact(&mut head).await.map_err(short_or_io)?;

    let mut rand_nu = [0u8; 8];
    rand_nu.copy_from_slice(&head[..8]);
    let length = u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(FrameError::Oversize(length));
    }

    let mut payload = vec![0u8; length];
    r.read_exact(&mut payload).await.map_err(short_or_io)?;
    apply_keystream(&mut payload, token, &rand_nu);
    Ok(Packet { rand_nu, payload })
}

fn short_or_io(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Short
    } else {
        FrameError::Io(err)
    }
}

/// Encode `payload` under a fresh random nonce and write the whole frame.
/// Returns the number of plaintext bytes accepted.
pub async fn encode_write<W>(token: &[u8], w: &mut W, payload: &[u8]) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize(payload.len()));
    }
    let mut rand_nu = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rand_nu);

    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&rand_nu);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    apply_keystream(&mut frame[12..], token, &rand_nu);

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(payload.len())
}

/// Pump plaintext from `r` into framed writes on `w` until EOF, one frame per
/// read of at most [`COPY_CHUNK`] bytes. Returns the plaintext byte count.
pub async fn encode_copy<R, W>(token: &[u8], r: &mut R, w: &mut W) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        encode_write(token, w, &buf[..n]).await?;
        total += n as u64;
    }
}
