//! SOCKS5 UDP relay on the mixed listener's port.
//!
//! Datagrams arrive wrapped as `RSV(2) | FRAG(1) | ATYP | DST.ADDR |
//! DST.PORT | DATA`; only unfragmented packets are accepted. Each client
//! address gets a NAT socket toward the origin; replies come back wrapped in
//! the client's last request header. Sessions idle longer than the
//! configured timeout are evicted.

use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::resolver::Resolve;
use crate::types::HostPort;

const MAX_DATAGRAM: usize = 64 * 1024;

/// A parsed SOCKS5 UDP request header plus the data it carried.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpPacket<'a> {
    pub dest: HostPort,
    /// The raw header bytes, reused verbatim when wrapping replies.
    pub header: &'a [u8],
    pub data: &'a [u8],
}

/// Parse one encapsulated datagram. `None` for fragments and malformed
/// packets, both of which are dropped silently.
pub fn parse_packet(buf: &[u8]) -> Option<UdpPacket<'_>> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let atyp = buf[3];
    let (host, header_len) = match atyp {
        0x01 => {
            if buf.len() < 10 {
                return None;
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            (ip.to_string(), 10)
        }
        0x03 => {
            let len = *buf.get(4)? as usize;
            let end = 5 + len + 2;
            if buf.len() < end {
                return None;
            }
            let host = std::str::from_utf8(&buf[5..5 + len]).ok()?.to_string();
            (host, end)
        }
        0x04 => {
            if buf.len() < 22 {
                return None;
            }
            let mut oct = [0u8; 16];
            oct.copy_from_slice(&buf[4..20]);
            (Ipv6Addr::from(oct).to_string(), 22)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([buf[header_len - 2], buf[header_len - 1]]);
    Some(UdpPacket {
        dest: HostPort::new(host, port),
        header: &buf[..header_len],
        data: &buf[header_len..],
    })
}

struct Session {
    nat: Arc<UdpSocket>,
    last_seen: Arc<Mutex<Instant>>,
    header: Arc<Mutex<Vec<u8>>>,
    cancel: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Live UDP ASSOCIATE control connections. A relay session's lifetime is
/// bounded by the control connection that opened it: when the TCP side
/// closes, the matching NAT socket and relay task are cancelled at once,
/// not left to idle eviction.
#[derive(Clone, Default)]
pub struct Associations {
    inner: Arc<DashMap<u64, Association>>,
    next_id: Arc<AtomicU64>,
}

struct Association {
    client_ip: IpAddr,
    declared: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control connection. `declared` is the UDP source address
    /// the client announced in its request, when it announced a usable one.
    /// Dropping the guard unregisters it and ends the bound sessions.
    pub fn open(&self, client_ip: IpAddr, declared: Option<SocketAddr>) -> AssociationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.inner.insert(
            id,
            Association {
                client_ip,
                declared,
                cancel: cancel.clone(),
            },
        );
        AssociationGuard {
            registry: self.inner.clone(),
            id,
            cancel,
        }
    }

    /// Find the association governing datagrams from `client`: an exact
    /// declared-address match wins, otherwise any association from the same
    /// host that declared nothing usable.
    pub(crate) fn find(&self, client: SocketAddr) -> Option<CancellationToken> {
        let mut fallback = None;
        for entry in self.inner.iter() {
            match entry.declared {
                Some(declared) if declared == client => return Some(entry.cancel.clone()),
                None if entry.client_ip == client.ip() => {
                    fallback = Some(entry.cancel.clone());
                }
                _ => {}
            }
        }
        fallback
    }
}

pub struct AssociationGuard {
    registry: Arc<DashMap<u64, Association>>,
    id: u64,
    cancel: CancellationToken,
}

impl Drop for AssociationGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        self.cancel.cancel();
    }
}

/// Serve the relay until cancelled.
pub async fn listen(
    socket: Arc<UdpSocket>,
    cfg: ConfigHandle,
    resolver: Arc<dyn Resolve>,
    associations: Associations,
    cancel: CancellationToken,
) {
    let sessions: Arc<DashMap<SocketAddr, Session>> = Arc::new(DashMap::new());
    tokio::spawn(evict_idle(sessions.clone(), cfg.clone(), cancel.clone()));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, client) = match received {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "udp receive failed");
                continue;
            }
        };
        let Some(packet) = parse_packet(&buf[..n]) else {
            debug!(%client, "dropping fragmented or malformed udp packet");
            continue;
        };

        let ip = match resolver.resolve_ip(&packet.dest.host).await {
            Ok(ip) => ip,
            Err(err) => {
                debug!(%client, dest = %packet.dest, %err, "udp resolve failed");
                continue;
            }
        };
        let origin = SocketAddr::new(ip, packet.dest.port);

        // take what the send needs and release the map entry before awaiting
        let existing_nat = sessions.get(&client).map(|session| {
            *session.last_seen.lock().expect("lock poisoned") = Instant::now();
            *session.header.lock().expect("lock poisoned") = packet.header.to_vec();
            session.nat.clone()
        });
        if let Some(nat) = existing_nat {
            if let Err(err) = nat.send_to(packet.data, origin).await {
                debug!(%client, %origin, %err, "udp forward failed");
            }
            continue;
        }

        let bind_any: SocketAddr = match client {
            SocketAddr::V4(_) => (IpAddr::from(Ipv4Addr::UNSPECIFIED), 0).into(),
            SocketAddr::V6(_) => (IpAddr::from(Ipv6Addr::UNSPECIFIED), 0).into(),
        };
        let nat = match UdpSocket::bind(bind_any).await {
            Ok(nat) => Arc::new(nat),
            Err(err) => {
                warn!(%client, %err, "udp nat bind failed");
                continue;
            }
        };
        debug!(%client, %origin, "udp session opened");
        let session = Session {
            nat: nat.clone(),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            header: Arc::new(Mutex::new(packet.header.to_vec())),
            cancel: cancel.child_token(),
        };
        tokio::spawn(pump_replies(
            nat.clone(),
            socket.clone(),
            client,
            session.header.clone(),
            session.last_seen.clone(),
            session.cancel.clone(),
        ));
        let session_cancel = session.cancel.clone();
        sessions.insert(client, session);
        // The session dies with its control connection, or on eviction;
        // either way the map entry goes with it.
        {
            let sessions = sessions.clone();
            let session_cancel = session_cancel.clone();
            let association = associations.find(client);
            tokio::spawn(async move {
                match association {
                    Some(assoc) => tokio::select! {
                        _ = assoc.cancelled() => session_cancel.cancel(),
                        _ = session_cancel.cancelled() => {}
                    },
                    None => session_cancel.cancelled().await,
                }
                sessions.remove(&client);
            });
        }
        if let Err(err) = nat.send_to(packet.data, origin).await {
            debug!(%client, %origin, %err, "udp forward failed");
        }
    }
}

/// Copy origin replies back to the client, re-wrapped in its request header.
async fn pump_replies(
    nat: Arc<UdpSocket>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    header: Arc<Mutex<Vec<u8>>>,
    last_seen: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = nat.recv_from(&mut buf) => received,
        };
        let (n, _origin) = match received {
            Ok(pair) => pair,
            Err(_) => break,
        };
        *last_seen.lock().expect("lock poisoned") = Instant::now();
        let mut out = header.lock().expect("lock poisoned").clone();
        out.extend_from_slice(&buf[..n]);
        if socket.send_to(&out, client).await.is_err() {
            break;
        }
    }
}

async fn evict_idle(
    sessions: Arc<DashMap<SocketAddr, Session>>,
    cfg: ConfigHandle,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let idle_after = cfg.snapshot().timeout.max(Duration::from_secs(30));
        sessions.retain(|client, session| {
            let keep =
                session.last_seen.lock().expect("lock poisoned").elapsed() < idle_after;
            if !keep {
                debug!(%client, "udp session evicted");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::resolver::StaticResolver;

    #[test]
    fn parses_ipv4_header() {
        let mut buf = vec![0, 0, 0, 0x01, 192, 0, 2, 1];
        buf.extend_from_slice(&53u16.to_be_bytes());
        buf.extend_from_slice(b"payload");
        let packet = parse_packet(&buf).unwrap();
        assert_eq!(packet.dest, HostPort::new("192.0.2.1", 53));
        assert_eq!(packet.header, &buf[..10]);
        assert_eq!(packet.data, b"payload");
    }

    #[test]
    fn parses_domain_header() {
        let mut buf = vec![0, 0, 0, 0x03, 6];
        buf.extend_from_slice(b"origin");
        buf.extend_from_slice(&8125u16.to_be_bytes());
        buf.extend_from_slice(b"x");
        let packet = parse_packet(&buf).unwrap();
        assert_eq!(packet.dest, HostPort::new("origin", 8125));
        assert_eq!(packet.data, b"x");
    }

    #[test]
    fn fragments_and_garbage_are_dropped() {
        // FRAG != 0
        assert!(parse_packet(&[0, 0, 1, 0x01, 1, 2, 3, 4, 0, 53]).is_none());
        // unknown atyp
        assert!(parse_packet(&[0, 0, 0, 0x09, 0, 0]).is_none());
        // truncated
        assert!(parse_packet(&[0, 0, 0, 0x01, 1, 2]).is_none());
        assert!(parse_packet(&[]).is_none());
    }

    #[tokio::test]
    async fn relays_to_the_origin_and_wraps_the_reply() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = origin.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            origin.send_to(b"pong", from).await.unwrap();
        });

        let relay_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = relay_socket.local_addr().unwrap();
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::new());
        let cancel = CancellationToken::new();
        tokio::spawn(listen(
            relay_socket,
            ConfigHandle::for_tests(Config::default()),
            resolver,
            Associations::new(),
            cancel.clone(),
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![0, 0, 0, 0x01];
        match origin_addr.ip() {
            IpAddr::V4(ip) => packet.extend_from_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!(),
        }
        packet.extend_from_slice(&origin_addr.port().to_be_bytes());
        packet.extend_from_slice(b"ping");
        client.send_to(&packet, relay_addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(&buf[..10], &packet[..10], "reply carries the request header");
        assert_eq!(&buf[10..n], b"pong");

        origin_task.await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn control_close_tears_down_the_session_at_once() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let relay_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = relay_socket.local_addr().unwrap();
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::new());
        let associations = Associations::new();
        let cancel = CancellationToken::new();
        tokio::spawn(listen(
            relay_socket,
            ConfigHandle::for_tests(Config::default()),
            resolver,
            associations.clone(),
            cancel.clone(),
        ));

        // a control connection is up for this host
        let guard = associations.open("127.0.0.1".parse().unwrap(), None);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![0, 0, 0, 0x01];
        match origin_addr.ip() {
            IpAddr::V4(ip) => packet.extend_from_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!(),
        }
        packet.extend_from_slice(&origin_addr.port().to_be_bytes());
        packet.extend_from_slice(b"ping");
        client.send_to(&packet, relay_addr).await.unwrap();

        // session is live: the origin sees the datagram and can answer
        let mut buf = [0u8; 128];
        let (n, nat_addr) = origin.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        origin.send_to(b"pong", nat_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(&buf[10..n], b"pong");

        // closing the control side cancels the NAT session immediately
        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;
        origin.send_to(b"late", nat_addr).await.unwrap();
        let late = tokio::time::timeout(
            Duration::from_millis(300),
            client.recv_from(&mut buf),
        )
        .await;
        assert!(late.is_err(), "no relay after the control connection closed");

        cancel.cancel();
    }
}
