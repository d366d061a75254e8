//! Work dispatcher: a process-wide unbounded queue of handshaken connections
//! drained by a pool of consumer tasks, each spawning one handler per
//! connection. The handler dials outbound, wires the envelope in Client mode,
//! sends the deferred handshake reply and runs the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::error;

use crate::codec;
use crate::error::Error;
use crate::relay::{Relay, RelayKind};
use crate::resolver::Resolve;
use crate::stats::TrafficTracker;
use crate::tls;
use crate::types::{HostPort, Mode, ProxyStream, TcpContext};

/// Capacity hint carried over from the original queue; the channel itself is
/// unbounded and accept never blocks on it.
pub const QUEUE_CAPACITY_HINT: usize = 10_000;

/// Handle for feeding handshaken connections into the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    tx: async_channel::Sender<TcpContext>,
}

impl Dispatcher {
    /// Bare queue without workers, for wiring listeners to a harness.
    pub fn unbounded() -> (Self, async_channel::Receiver<TcpContext>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn submit(&self, ctx: TcpContext) {
        // Unbounded: try_send only fails once every worker is gone, and then
        // dropping the context closes the connection and releases its guard.
        if let Err(err) = self.tx.try_send(ctx) {
            error!(%err, "work queue rejected a connection");
        }
    }
}

fn worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(4);
    cores * cores
}

/// Start the consumer pool and return the queue handle shared by every
/// listener.
pub fn start(mode: Mode, resolver: Arc<dyn Resolve>) -> Dispatcher {
    let (dispatcher, rx) = Dispatcher::unbounded();
    for _ in 0..worker_count() {
        let rx = rx.clone();
        let resolver = resolver.clone();
        tokio::spawn(async move {
            while let Ok(ctx) = rx.recv().await {
                tokio::spawn(handle(ctx, mode, resolver.clone()));
            }
        });
    }
    dispatcher
}

/// Drive one connection end to end. Every exit path drops the context's
/// streams (closing them) and its work guard.
pub async fn handle(ctx: TcpContext, mode: Mode, resolver: Arc<dyn Resolve>) {
    let TcpContext {
        conn: mut src_conn,
        metadata,
        line,
        reply,
        guard: _guard,
        cfg,
    } = ctx;

    // In client mode every flow goes to the paired server; otherwise to the
    // flow's own destination.
    let target = if mode == Mode::Client {
        HostPort::new(cfg.server.host.clone(), cfg.server.port)
    } else {
        metadata.dest.clone()
    };

    let ip = match resolver.resolve_ip(&target.host).await {
        Ok(ip) => ip,
        Err(err) => {
            error!(id = %metadata.id, src = %metadata.src, dest = %metadata.dest, %err, "resolve failed");
            return;
        }
    };
    let addr = SocketAddr::new(ip, target.port);

    let mut dest_conn = match dial(&addr, cfg.timeout, mode, &cfg, &target.host).await {
        Ok(conn) => conn,
        Err(err) => {
            error!(id = %metadata.id, src = %metadata.src, dest = %metadata.dest, %err, "dial failed");
            return;
        }
    };

    let token: Vec<u8> = match mode {
        Mode::Client => cfg.server.token.clone().into_bytes(),
        _ => cfg.local.token.clone().into_bytes(),
    };

    // Client mode opens the tunnel with the literal destination, and the
    // rewritten request block when the flow is a forward HTTP proxy one.
    if mode == Mode::Client {
        if let Err(err) = codec::encode_write(&token, &mut dest_conn, metadata.dest.to_string().as_bytes()).await {
            error!(id = %metadata.id, src = %metadata.src, dest = %metadata.dest, %err, "tunnel open failed");
            return;
        }
        if !line.is_empty() {
            if let Err(err) = codec::encode_write(&token, &mut dest_conn, line.as_bytes()).await {
                error!(id = %metadata.id, src = %metadata.src, dest = %metadata.dest, %err, "tunnel open failed");
                return;
            }
        }
    }

    if let Some(reply) = reply {
        if let Err(err) = reply.write(&mut src_conn).await {
            error!(id = %metadata.id, src = %metadata.src, %err, "handshake reply failed");
            return;
        }
    }

    if mode == Mode::Direct && !line.is_empty() {
        if let Err(err) = dest_conn.write_all(line.as_bytes()).await {
            error!(id = %metadata.id, src = %metadata.src, dest = %metadata.dest, %err, "request replay failed");
            return;
        }
    }

    let dest_conn: ProxyStream = Box::new(TrafficTracker::new(dest_conn, metadata.clone()));

    let (src, dest, kind) = match mode {
        Mode::Direct => (src_conn, dest_conn, RelayKind::Direct),
        Mode::Server => (src_conn, dest_conn, RelayKind::Forward),
        // The tunnel connection is the framed side, so the roles swap.
        Mode::Client => (dest_conn, src_conn, RelayKind::Forward),
    };
    Relay {
        src,
        dest,
        metadata,
        token,
    }
    .start(kind)
    .await;
}

async fn dial(
    addr: &SocketAddr,
    timeout: Duration,
    mode: Mode,
    cfg: &crate::config::Config,
    server_name: &str,
) -> Result<ProxyStream, Error> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::DialFailed(
                addr.to_string(),
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            )
        })?
        .map_err(|e| Error::DialFailed(addr.to_string(), e))?;
    let _ = stream.set_nodelay(true);

    if cfg.tls.enable && mode == Mode::Client {
        let stream = tls::connect(stream, server_name).await?;
        Ok(Box::new(stream))
    } else {
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::resolver::StaticResolver;
    use crate::types::{ConnectReply, Metadata, Network, Proto};
    use crate::waitgroup::WaitGroup;
    use std::net::IpAddr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_origin() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut got = vec![0u8; 4];
            conn.read_exact(&mut got).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
            got
        });
        (addr, task)
    }

    #[tokio::test]
    async fn direct_mode_relays_and_sends_the_deferred_reply() {
        let (origin_addr, origin) = echo_origin().await;
        let resolver: Arc<dyn Resolve> = Arc::new(
            StaticResolver::new().with("origin.test", IpAddr::from([127, 0, 0, 1])),
        );

        let (mut client, client_far) = duplex(4096);
        let wg = WaitGroup::new();
        let metadata = Metadata::new(
            Network::Tcp,
            Proto::Socks5,
            HostPort::new("127.0.0.1", 9),
            HostPort::new("origin.test", origin_addr.port()),
        );
        let ctx = TcpContext {
            conn: Box::new(client_far),
            metadata,
            line: String::new(),
            reply: Some(ConnectReply::Socks5),
            guard: wg.add(),
            cfg: Arc::new(Config::default()),
        };

        let worker = tokio::spawn(handle(ctx, Mode::Direct, resolver));

        // deferred success reply arrives before any data
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");
        assert_eq!(origin.await.unwrap(), b"ping");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should finish")
            .unwrap();
        assert_eq!(wg.count(), 0, "guard released on teardown");
    }

    #[tokio::test]
    async fn client_mode_opens_the_tunnel_with_the_destination_frame() {
        let token = "k";
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let tunnel_server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let first = codec::read_full(b"k", &mut conn).await.unwrap();
            // answer through the envelope like the paired server would
            codec::encode_write(b"k", &mut conn, b"pong").await.unwrap();
            String::from_utf8(first.payload).unwrap()
        });

        let cfg = Config {
            server: crate::config::Endpoint {
                host: "127.0.0.1".into(),
                port: server_addr.port(),
                token: token.into(),
            },
            ..Config::default()
        };

        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::new());
        let (mut client, client_far) = duplex(4096);
        let wg = WaitGroup::new();
        let metadata = Metadata::new(
            Network::Tcp,
            Proto::Socks5,
            HostPort::new("127.0.0.1", 9),
            HostPort::new("origin", 80),
        );
        let ctx = TcpContext {
            conn: Box::new(client_far),
            metadata,
            line: String::new(),
            reply: Some(ConnectReply::Socks5),
            guard: wg.add(),
            cfg: Arc::new(cfg),
        };

        let worker = tokio::spawn(handle(ctx, Mode::Client, resolver));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);

        // decoded tunnel payload flows back to the client in the clear
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        assert_eq!(tunnel_server.await.unwrap(), "origin:80");
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_failure_tears_down_and_releases_the_guard() {
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::new());
        let (client, client_far) = duplex(64);
        let wg = WaitGroup::new();
        let metadata = Metadata::new(
            Network::Tcp,
            Proto::Socks4,
            HostPort::new("127.0.0.1", 9),
            HostPort::new("nowhere.invalid", 80),
        );
        let ctx = TcpContext {
            conn: Box::new(client_far),
            metadata,
            line: String::new(),
            reply: Some(ConnectReply::Socks4),
            guard: wg.add(),
            cfg: Arc::new(Config::default()),
        };
        handle(ctx, Mode::Direct, resolver).await;
        assert_eq!(wg.count(), 0);
        drop(client);
    }
}
