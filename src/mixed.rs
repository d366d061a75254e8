//! Mixed listener: one TCP port speaking SOCKS4, SOCKS5 and HTTP proxy at
//! once, plus the paired UDP socket for SOCKS5 UDP ASSOCIATE. The first
//! peeked byte picks the handler; the byte stays visible to it through the
//! buffered wrapper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::peek::BufferedStream;
use crate::proxyproto;
use crate::resolver::Resolve;
use crate::tunnel::Dispatcher;
use crate::types::ProxyStream;
use crate::udp;
use crate::waitgroup::WaitGroup;
use crate::{http, socks4, socks5};

pub struct Listener {
    cfg: ConfigHandle,
    dispatcher: Dispatcher,
    resolver: Arc<dyn Resolve>,
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    associations: udp::Associations,
    wg: WaitGroup,
    cancel: CancellationToken,
}

impl Listener {
    pub async fn bind(
        cfg: ConfigHandle,
        dispatcher: Dispatcher,
        resolver: Arc<dyn Resolve>,
    ) -> Result<Self> {
        let snapshot = cfg.snapshot();
        let addr = format!("{}:{}", snapshot.local.host, snapshot.local.port);
        let tcp = TcpListener::bind(&addr).await.map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        let udp = UdpSocket::bind(&addr).await.map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        Ok(Self {
            cfg,
            dispatcher,
            resolver,
            tcp,
            udp: Arc::new(udp),
            associations: udp::Associations::new(),
            wg: WaitGroup::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.tcp.local_addr().expect("bound listener has an address")
    }

    pub fn udp_address(&self) -> SocketAddr {
        self.udp.local_addr().expect("bound socket has an address")
    }

    pub async fn run(self: Arc<Self>) {
        info!(udp = %self.udp_address(), "UDP server listening");
        tokio::spawn(udp::listen(
            self.udp.clone(),
            self.cfg.clone(),
            self.resolver.clone(),
            self.associations.clone(),
            self.cancel.clone(),
        ));

        let addr = self.address();
        info!(
            listen = %format!("http://{addr} socks4://{addr} socks5://{addr}"),
            "TCP server listening",
        );
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
        let mut conn = BufferedStream::new(conn);

        // A front balancer may declare the real client; auth sees that one.
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

        let head = match conn.peek(1).await {
            Ok(head) => head[0],
            Err(err) => {
                error!(%id, %src, %err, "peek failed");
                return;
            }
        };
        let conn: ProxyStream = Box::new(conn);
        // handshake errors are logged by the handlers; dropping the stream
        // closes the connection
        let _ = match head {
            socks4::VERSION => {
                socks4::handle(conn, id, src, cfg, guard, &self.dispatcher).await
            }
            socks5::VERSION => {
                socks5::handle(
                    conn,
                    id,
                    src,
                    self.udp_address(),
                    &self.associations,
                    cfg,
                    guard,
                    &self.dispatcher,
                )
                .await
            }
            _ => http::handle(conn, id, src, cfg, guard, &self.dispatcher).await,
        };
    }

    /// Stop accepting and wait for outstanding work to drain.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        tokio::time::timeout(timeout, self.wg.wait())
            .await
            .map_err(|_| Error::ShutdownTimedOut)?;
        info!("server closed");
        Ok(())
    }
}
