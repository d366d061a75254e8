use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use crate::types::Metadata;

lazy_static::lazy_static! {
    /// Process-wide traffic manager, polled by the control plane.
    pub static ref DEFAULT_MANAGER: Manager = Manager::new();
}

/// Monotonic up/down byte counters plus a live-connection registry.
pub struct Manager {
    up: AtomicU64,
    down: AtomicU64,
    connections: DashMap<Uuid, Arc<ConnEntry>>,
}

pub struct ConnEntry {
    pub metadata: Metadata,
    pub upload: AtomicU64,
    pub download: AtomicU64,
    pub start: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    #[serde(flatten)]
    pub metadata: Metadata,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
            connections: DashMap::new(),
        }
    }

    /// Current (up, down) totals.
    pub fn now(&self) -> (u64, u64) {
        (self.up.load(Ordering::Relaxed), self.down.load(Ordering::Relaxed))
    }

    fn register(&self, metadata: Metadata) -> Arc<ConnEntry> {
        let entry = Arc::new(ConnEntry {
            metadata,
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            start: Utc::now(),
        });
        self.connections.insert(entry.metadata.id, entry.clone());
        entry
    }

    fn unregister(&self, id: &Uuid) {
        self.connections.remove(id);
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|e| ConnectionSnapshot {
                id: e.metadata.id,
                metadata: e.metadata.clone(),
                upload: e.upload.load(Ordering::Relaxed),
                download: e.download.load(Ordering::Relaxed),
                start: e.start,
            })
            .collect()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that meters every successful read (down) and write (up),
/// both globally and on the connection's registry entry.
pub struct TrafficTracker<S> {
    inner: S,
    manager: &'static Manager,
    entry: Arc<ConnEntry>,
}

impl<S> TrafficTracker<S> {
    pub fn new(inner: S, metadata: Metadata) -> Self {
        Self::with_manager(inner, metadata, &DEFAULT_MANAGER)
    }

    pub fn with_manager(inner: S, metadata: Metadata, manager: &'static Manager) -> Self {
        let entry = manager.register(metadata);
        Self {
            inner,
            manager,
            entry,
        }
    }
}

impl<S> Drop for TrafficTracker<S> {
    fn drop(&mut self) {
        self.manager.unregister(&self.entry.metadata.id);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrafficTracker<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = out.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, out) {
            Poll::Ready(Ok(())) => {
                let n = (out.filled().len() - before) as u64;
                if n > 0 {
                    me.manager.down.fetch_add(n, Ordering::Relaxed);
                    me.entry.download.fetch_add(n, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrafficTracker<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    me.manager.up.fetch_add(n as u64, Ordering::Relaxed);
                    me.entry.upload.fetch_add(n as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
