//! Server-mode listener: terminates the framed tunnel. Each accepted
//! connection (optionally TLS) must open with one envelope frame whose
//! payload is the literal UTF-8 `host:port` destination; the connection then
//! joins the work queue as an already-handshaken flow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::codec;
use crate::config::ConfigHandle;
use crate::error::{Error, FrameError, Result};
use crate::peek::BufferedStream;
use crate::proxyproto;
use crate::tunnel::Dispatcher;
use crate::types::{HostPort, Metadata, Network, Proto, ProxyStream, TcpContext};
use crate::waitgroup::WaitGroup;

pub struct Listener {
    cfg: ConfigHandle,
    dispatcher: Dispatcher,
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    wg: WaitGroup,
    cancel: CancellationToken,
}

impl Listener {
    pub async fn bind(cfg: ConfigHandle, dispatcher: Dispatcher) -> Result<Self> {
        let snapshot = cfg.snapshot();
        let addr = format!("{}:{}", snapshot.local.host, snapshot.local.port);
        let tcp = TcpListener::bind(&addr).await.map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        let tls = if snapshot.tls.enable {
            Some(crate::tls::acceptor(&snapshot.tls)?)
        } else {
            None
        };
        Ok(Self {
            cfg,
            dispatcher,
            tcp,
            tls,
            wg: WaitGroup::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.tcp.local_addr().expect("bound listener has an address")
    }

    pub async fn run(self: Arc<Self>) {
        info!(listen = %self.address(), "TCP server listening");
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.tcp.accept() => accepted,
            };
            let (conn, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!("{}", Error::Accept(err));
                    continue;
                }
            };
            let me = self.clone();
            tokio::spawn(async move {
                me.handle(conn, peer).await;
            });
        }
    }

    async fn handle(&self, conn: TcpStream, peer: SocketAddr) {
        let id = Uuid::new_v4();
        let cfg = self.cfg.snapshot();
        let _ = conn.set_nodelay(true);

        let conn: ProxyStream = match &self.tls {
            Some(acceptor) => match acceptor.accept(conn).await {
                Ok(tls_conn) => Box::new(tls_conn),
                Err(err) => {
                    error!(%id, %peer, %err, "tls accept failed");
                    return;
                }
            },
            None => Box::new(conn),
        };
        let mut conn = BufferedStream::new(conn);

        let src = match proxyproto::strip_proxy_header(&mut conn).await {
            Ok(declared) => declared.unwrap_or(peer),
            Err(err) => {
                error!(%id, %peer, %err, "rejecting connection");
                return;
            }
        };
        if !auth::verify_ip(&cfg, src.ip()) {
            warn!("{}", Error::AuthDeniedIp(src.to_string()));
            return;
        }
        let guard = self.wg.add();

        let token = cfg.local.token.as_bytes().to_vec();
        let packet = match codec::read_full(&token, &mut conn).await {
            Ok(packet) => packet,
            Err(err) => {
                error!(%id, %src, %err, "tunnel open frame unreadable");
                return;
            }
        };
        let Ok(dest_raw) = String::from_utf8(packet.payload) else {
            error!(%id, %src, err = %FrameError::Decrypt, "tunnel open frame unreadable");
            return;
        };
        let Some(dest) = HostPort::parse(&dest_raw) else {
            error!(%id, %src, dest = %dest_raw, "tunnel opened with a bad destination");
            return;
        };
        debug!(%id, %src, dest = %dest, nonce = %hex::encode(packet.rand_nu), "tunnel opened");

        let metadata = Metadata {
            id,
            network: Network::Tcp,
            proto: Proto::Socks5,
            src: HostPort::from(src),
            dest,
        };
        self.dispatcher.submit(TcpContext {
            conn: Box::new(conn),
            metadata,
            line: String::new(),
            reply: None,
            guard,
            cfg,
        });
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        tokio::time::timeout(timeout, self.wg.wait())
            .await
            .map_err(|_| Error::ShutdownTimedOut)?;
        info!("server closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn listener_with(cfg: Config) -> (Arc<Listener>, async_channel::Receiver<TcpContext>) {
        let mut cfg = cfg;
        cfg.local.host = "127.0.0.1".into();
        cfg.local.port = 0;
        let handle = ConfigHandle::for_tests(cfg);
        let (dispatcher, rx) = Dispatcher::unbounded();
        let listener = Arc::new(Listener::bind(handle, dispatcher).await.unwrap());
        tokio::spawn(listener.clone().run());
        (listener, rx)
    }

    #[tokio::test]
    async fn first_frame_becomes_the_destination() {
        let cfg = Config {
            local: crate::config::Endpoint {
                host: String::new(),
                port: 0,
                token: "k".into(),
            },
            ..Config::default()
        };
        let (listener, rx) = listener_with(cfg).await;

        let mut conn = TcpStream::connect(listener.address()).await.unwrap();
        codec::encode_write(b"k", &mut conn, b"origin:80").await.unwrap();

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.proto, Proto::Socks5);
        assert_eq!(ctx.metadata.dest, HostPort::new("origin", 80));
        assert!(ctx.reply.is_none());
        assert!(ctx.line.is_empty());

        drop(ctx);
        drop(conn);
        listener.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn garbage_open_frame_closes_the_tunnel() {
        let cfg = Config {
            local: crate::config::Endpoint {
                host: String::new(),
                port: 0,
                token: "k".into(),
            },
            ..Config::default()
        };
        let (listener, rx) = listener_with(cfg).await;

        let mut conn = TcpStream::connect(listener.address()).await.unwrap();
        // truncated header: not even a full frame
        tokio::io::AsyncWriteExt::write_all(&mut conn, &[0u8; 5]).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut conn).await.unwrap();

        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(rx.try_recv().is_err());
        listener.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
