use serde::{Serialize, Serializer};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::config::Config;
use crate::waitgroup::WorkGuard;

/// Operating mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain proxy: dial the origin directly.
    Direct,
    /// Framed-tunnel originator: forward flows to a paired server.
    Client,
    /// Framed-tunnel terminator: unwrap flows and dial the origin.
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Inbound proxy protocol that produced a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http,
    HttpConnect,
    Socks4,
    Socks5,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Http => write!(f, "HTTP"),
            Proto::HttpConnect => write!(f, "HTTPS"),
            Proto::Socks4 => write!(f, "Socks4"),
            Proto::Socks5 => write!(f, "Socks5"),
        }
    }
}

impl Serialize for Proto {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// A host (literal IP or domain name) and port. `Display` renders the
/// `host:port` form used on the wire as the tunnel's first frame, with
/// IPv6 literals bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, accepting `[v6]:port` for IPv6 literals.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Serialize for HostPort {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Immutable descriptor of one proxied flow.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    #[serde(skip)]
    pub id: Uuid,
    pub network: Network,
    #[serde(rename = "type")]
    pub proto: Proto,
    pub src: HostPort,
    pub dest: HostPort,
}

impl Metadata {
    pub fn new(network: Network, proto: Proto, src: HostPort, dest: HostPort) -> Self {
        Self {
            id: Uuid::new_v4(),
            network,
            proto,
            src,
            dest,
        }
    }
}

/// Byte stream a proxied connection flows over. Boxed so TCP, buffered and
/// TLS streams all ride the same context.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ProxyStream = Box<dyn AsyncStream>;

/// Success reply owed to the client once the outbound dial lands. The worker
/// renders and writes it right before relaying starts; nothing is sent at
/// handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    Socks4,
    Socks5,
    HttpConnect,
}

impl ConnectReply {
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(self, w: &mut W) -> io::Result<()> {
        match self {
            ConnectReply::Socks4 => {
                w.write_all(&[0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
                    .await?;
            }
            ConnectReply::Socks5 => {
                w.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            }
            ConnectReply::HttpConnect => {
                let header = format!(
                    "HTTP/1.1 200 OK Connection Established\r\nDate: {}\r\nTransfer-Encoding: chunked\r\n\r\n",
                    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
                );
                w.write_all(header.as_bytes()).await?;
            }
        }
        w.flush().await
    }
}

/// The unit that flows through the work queue: a handshaken inbound stream
/// plus everything the worker needs to dial out and relay.
pub struct TcpContext {
    pub conn: ProxyStream,
    pub metadata: Metadata,
    /// Rewritten first HTTP request block to replay to the origin
    /// (forward-proxy mode only); empty otherwise.
    pub line: String,
    pub reply: Option<ConnectReply>,
    /// Releases the owning listener's outstanding-work count when dropped.
    pub guard: WorkGuard,
    /// Config snapshot captured at accept time; hot reloads never touch an
    /// in-flight connection.
    pub cfg: Arc<Config>,
}

impl fmt::Debug for TcpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpContext")
            .field("metadata", &self.metadata)
            .field("line", &self.line.len())
            .field("reply", &self.reply)
            .finish()
    }
}
