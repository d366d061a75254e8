//! SOCKS5 handshake (RFC 1928) with USER/PASS sub-negotiation (RFC 1929),
//! CONNECT and UDP ASSOCIATE. BIND is refused. The CONNECT success reply is
//! deferred to the worker; UDP ASSOCIATE answers immediately with the UDP
//! listener's bind address and parks the control connection — its close ends
//! the UDP session.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tunnel::Dispatcher;
use crate::types::{ConnectReply, HostPort, Metadata, Network, Proto, ProxyStream, TcpContext};
use crate::udp::Associations;
use crate::waitgroup::WorkGuard;

pub const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub async fn handle(
    mut conn: ProxyStream,
    id: Uuid,
    src: SocketAddr,
    udp_addr: SocketAddr,
    associations: &Associations,
    cfg: Arc<Config>,
    guard: WorkGuard,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let (command, dest) = match handshake(&mut conn, id, src, &cfg).await {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(%id, %src, %err, "socks5 handshake failed");
            return Err(err);
        }
    };

    match command {
        CMD_CONNECT => {
            let metadata = Metadata {
                id,
                network: Network::Tcp,
                proto: Proto::Socks5,
                src: HostPort::from(src),
                dest,
            };
            dispatcher.submit(TcpContext {
                conn,
                metadata,
                line: String::new(),
                reply: Some(ConnectReply::Socks5),
                guard,
                cfg,
            });
            Ok(())
        }
        CMD_UDP_ASSOCIATE => {
            // The request address, when usable, is the UDP source the client
            // will send from; 0.0.0.0:0 means "wait for the first datagram".
            let declared = dest
                .host
                .parse::<std::net::IpAddr>()
                .ok()
                .filter(|ip| !ip.is_unspecified() && dest.port != 0)
                .map(|ip| SocketAddr::new(ip, dest.port));
            let _association = associations.open(src.ip(), declared);
            info!(%id, %src, udp = %udp_addr, "udp associate session opened");
            write_reply(&mut conn, 0x00, udp_addr).await?;
            // Hold the control connection; its close ends the UDP session,
            // tearing the bound relay down through the association guard.
            let mut sink = [0u8; 64];
            loop {
                match conn.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            info!(%id, %src, "udp associate session closed");
            drop(guard);
            Ok(())
        }
        // BIND (0x02) and anything unknown
        other => {
            let zero = SocketAddr::from(([0, 0, 0, 0], 0));
            write_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED, zero).await?;
            Err(Error::Handshake(format!("unsupported socks5 command {other}")))
        }
    }
}

/// Runs method selection, optional USER/PASS sub-negotiation and the request
/// parse. Returns the command and destination; replies for CONNECT are the
/// caller's business.
async fn handshake(
    conn: &mut ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: &Config,
) -> Result<(u8, HostPort)> {
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Handshake(format!("bad socks version {:#04x}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    conn.read_exact(&mut methods).await?;

    let wanted = if auth::user_enabled(cfg) {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        conn.write_all(&[VERSION, METHOD_UNACCEPTABLE]).await?;
        return Err(Error::Handshake("no acceptable auth method".into()));
    }
    conn.write_all(&[VERSION, wanted]).await?;

    if wanted == METHOD_USER_PASS {
        negotiate_user_pass(conn, id, src, cfg).await?;
    }

    let mut req = [0u8; 4];
    conn.read_exact(&mut req).await?;
    if req[0] != VERSION {
        return Err(Error::Handshake(format!("bad request version {:#04x}", req[0])));
    }
    let dest = read_addr(conn, req[3]).await?;
    info!(%id, %src, dest = %dest, command = req[1], "socks5 request");
    Ok((req[1], dest))
}

async fn negotiate_user_pass(
    conn: &mut ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: &Config,
) -> Result<()> {
    let ver = conn.read_u8().await?;
    if ver != 0x01 {
        return Err(Error::Handshake(format!("bad auth subnegotiation version {ver:#04x}")));
    }
    let ulen = conn.read_u8().await? as usize;
    let mut user = vec![0u8; ulen];
    conn.read_exact(&mut user).await?;
    let plen = conn.read_u8().await? as usize;
    let mut pass = vec![0u8; plen];
    conn.read_exact(&mut pass).await?;

    let user = String::from_utf8_lossy(&user).into_owned();
    let pass = String::from_utf8_lossy(&pass).into_owned();
    info!(%id, %src, user, "socks5 credentials offered");

    if auth::verify_user(cfg, &user, &pass, src.ip()) {
        conn.write_all(&[0x01, 0x00]).await?;
        Ok(())
    } else {
        conn.write_all(&[0x01, 0x01]).await?;
        Err(Error::AuthDeniedUser(user))
    }
}

async fn read_addr(conn: &mut ProxyStream, atyp: u8) -> Result<HostPort> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            conn.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = conn.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            conn.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| Error::Handshake("domain is not utf-8".into()))?
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            conn.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        other => return Err(Error::Handshake(format!("unsupported address type {other:#04x}"))),
    };
    let mut port = [0u8; 2];
    conn.read_exact(&mut port).await?;
    Ok(HostPort::new(host, u16::from_be_bytes(port)))
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT` with the given bind address.
async fn write_reply(conn: &mut ProxyStream, rep: u8, bind: SocketAddr) -> Result<()> {
    let mut reply = vec![VERSION, rep, 0x00];
    match bind {
        SocketAddr::V4(v4) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.ip().octets());
        }
    }
    reply.extend_from_slice(&bind.port().to_be_bytes());
    conn.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::User;
    use crate::waitgroup::WaitGroup;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn src() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn udp() -> SocketAddr {
        "127.0.0.1:1080".parse().unwrap()
    }

    #[tokio::test]
    async fn connect_with_domain_queues_context() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (dispatcher, rx) = Dispatcher::unbounded();
        let wg = WaitGroup::new();
        handle(
            Box::new(server),
            Uuid::new_v4(),
            src(),
            udp(),
            &Associations::new(),
            Arc::new(Config::default()),
            wg.add(),
            &dispatcher,
        )
        .await
        .unwrap();

        // method selection reply only; the success reply is the worker's job
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);

        let ctx = rx.try_recv().unwrap();
        assert_eq!(ctx.metadata.proto, Proto::Socks5);
        assert_eq!(ctx.metadata.dest, HostPort::new("example.com", 80));
        assert_eq!(ctx.reply, Some(ConnectReply::Socks5));
    }

    #[tokio::test]
    async fn user_pass_subnegotiation_accepts_valid_credentials() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        // RFC 1929: VER ULEN UNAME PLEN PASSWD
        client.write_all(&[0x01, 0x01, b'u', 0x01, b'p']).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let cfg = Config {
            users: vec![User {
                username: "u".into(),
                password: "p".into(),
                cidr: vec![],
            }],
            ..Config::default()
        };
        let (dispatcher, rx) = Dispatcher::unbounded();
        let wg = WaitGroup::new();
        handle(
            Box::new(server),
            Uuid::new_v4(),
            src(),
            udp(),
            &Associations::new(),
            Arc::new(cfg),
            wg.add(),
            &dispatcher,
        )
        .await
        .unwrap();

        let mut bytes = [0u8; 4];
        client.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes, [0x05, 0x02, 0x01, 0x00]);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bad_credentials_answer_the_reject_code() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client.write_all(&[0x01, 0x01, b'u', 0x01, b'x']).await.unwrap();

        let cfg = Config {
            users: vec![User {
                username: "u".into(),
                password: "p".into(),
                cidr: vec![],
            }],
            ..Config::default()
        };
        let (dispatcher, rx) = Dispatcher::unbounded();
        let wg = WaitGroup::new();
        let err = handle(
            Box::new(server),
            Uuid::new_v4(),
            src(),
            udp(),
            &Associations::new(),
            Arc::new(cfg),
            wg.add(),
            &dispatcher,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AuthDeniedUser(_)));
        assert!(rx.try_recv().is_err());

        let mut bytes = [0u8; 4];
        client.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn bind_command_is_refused_with_code_7() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut req = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (dispatcher, rx) = Dispatcher::unbounded();
        let wg = WaitGroup::new();
        let err = handle(
            Box::new(server),
            Uuid::new_v4(),
            src(),
            udp(),
            &Associations::new(),
            Arc::new(Config::default()),
            wg.add(),
            &dispatcher,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(rx.try_recv().is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply[..2]).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn udp_associate_replies_with_the_udp_bind_address() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut req = vec![0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0];
        req.extend_from_slice(&0u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (dispatcher, rx) = Dispatcher::unbounded();
        let wg = WaitGroup::new();
        let associations = Associations::new();
        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let associations = associations.clone();
            let guard = wg.add();
            async move {
                handle(
                    Box::new(server),
                    Uuid::new_v4(),
                    src(),
                    udp(),
                    &associations,
                    Arc::new(Config::default()),
                    guard,
                    &dispatcher,
                )
                .await
            }
        });

        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 1080);

        // the control connection is registered for datagrams from its host
        let probe: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert!(associations.find(probe).is_some());

        // no context is queued; closing the control side ends the session
        assert!(rx.try_recv().is_err());
        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(wg.count(), 0);
        assert!(
            associations.find(probe).is_none(),
            "association unregistered when the control side closed"
        );
    }
}
