//! Bidirectional relay between an accepted connection and the outbound side.
//!
//! `Direct` copies bytes verbatim; `Forward` keeps the tunnel side framed —
//! one direction encodes plaintext into envelope frames, the other decodes
//! frames back to plaintext. Whichever direction finishes first cancels a
//! shared token, kicking the peer direction out of its blocked read; the
//! relay only returns once both directions have stopped, and both streams
//! close when it does.

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::types::{Metadata, ProxyStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// Plain copy, both directions.
    Direct,
    /// `src` is the tunnel side: frames in, frames out.
    Forward,
}

pub struct Relay {
    pub src: ProxyStream,
    pub dest: ProxyStream,
    pub metadata: Metadata,
    pub token: Vec<u8>,
}

impl Relay {
    pub async fn start(self, kind: RelayKind) {
        let meta = self.metadata.clone();
        let started = std::time::Instant::now();
        info!(id = %meta.id, src = %meta.src, dest = %meta.dest, "accepted");
        match kind {
            RelayKind::Direct => self.direct().await,
            RelayKind::Forward => self.forward().await,
        }
        info!(
            id = %meta.id,
            src = %meta.src,
            dest = %meta.dest,
            elapsed = ?started.elapsed(),
            "finish",
        );
    }

    async fn direct(self) {
        let meta = self.metadata;
        let (mut src_r, mut src_w) = tokio::io::split(self.src);
        let (mut dest_r, mut dest_w) = tokio::io::split(self.dest);
        let cancel = CancellationToken::new();

        let downstream = {
            let cancel = cancel.clone();
            let meta = meta.clone();
            async move {
                let res = tokio::select! {
                    _ = cancel.cancelled() => Ok(0),
                    res = tokio::io::copy(&mut dest_r, &mut src_w) => res,
                };
                if let Err(err) = res {
                    warn!(id = %meta.id, dest = %meta.dest, src = %meta.src, %err, "relay error");
                }
                cancel.cancel();
                (dest_r, src_w)
            }
        };
        let upstream = {
            let cancel = cancel.clone();
            let meta = meta.clone();
            async move {
                let res = tokio::select! {
                    _ = cancel.cancelled() => Ok(0),
                    res = tokio::io::copy(&mut src_r, &mut dest_w) => res,
                };
                if let Err(err) = res {
                    warn!(id = %meta.id, src = %meta.src, dest = %meta.dest, %err, "relay error");
                }
                cancel.cancel();
                (src_r, dest_w)
            }
        };
        let ((dest_r, src_w), (src_r, dest_w)) = tokio::join!(downstream, upstream);

        let mut src = src_r.unsplit(src_w);
        let mut dest = dest_r.unsplit(dest_w);
        let _ = src.shutdown().await;
        let _ = dest.shutdown().await;
    }

    async fn forward(self) {
        let meta = self.metadata;
        let token = self.token;
        let (mut src_r, mut src_w) = tokio::io::split(self.src);
        let (mut dest_r, mut dest_w) = tokio::io::split(self.dest);
        let cancel = CancellationToken::new();

        // dest --> encode --> src
        let encode = {
            let cancel = cancel.clone();
            let token = token.clone();
            let meta = meta.clone();
            async move {
                let res = tokio::select! {
                    _ = cancel.cancelled() => Ok(0),
                    res = codec::encode_copy(&token, &mut dest_r, &mut src_w) => res,
                };
                if let Err(err) = res {
                    warn!(id = %meta.id, dest = %meta.dest, src = %meta.src, %err, "relay error");
                }
                cancel.cancel();
                (dest_r, src_w)
            }
        };
        // src --> decode --> dest
        let decode = {
            let cancel = cancel.clone();
            let meta = meta.clone();
            async move {
                let res = tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    res = decode_copy(&token, &mut src_r, &mut dest_w, &meta) => res,
                };
                if let Err(err) = res {
                    warn!(id = %meta.id, src = %meta.src, dest = %meta.dest, %err, "relay error");
                }
                cancel.cancel();
                (src_r, dest_w)
            }
        };
        let ((dest_r, src_w), (src_r, dest_w)) = tokio::join!(encode, decode);

        let mut src = src_r.unsplit(src_w);
        let mut dest = dest_r.unsplit(dest_w);
        let _ = src.shutdown().await;
        let _ = dest.shutdown().await;
    }
}

async fn decode_copy<R, W>(
    token: &[u8],
    r: &mut R,
    w: &mut W,
    meta: &Metadata,
) -> Result<(), crate::error::FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        let pack = codec::read_full(token, r).await?;
        debug!(
            id = %meta.id,
            src = %meta.src,
            dest = %meta.dest,
            nonce = %hex::encode(pack.rand_nu),
            "frame",
        );
        w.write_all(&pack.payload).await?;
    }
}
