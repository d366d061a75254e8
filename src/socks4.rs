//! SOCKS4 and SOCKS4a handshake.
//!
//! Request: `VER(0x04) | CMD | PORT(2 BE) | IP(4) | USER\0 [| HOSTNAME\0]`,
//! the hostname form signalled by an `0.0.0.x` address with `x != 0`.
//! The 8-byte success reply is deferred to the worker so it lands only after
//! the outbound dial succeeds.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tunnel::Dispatcher;
use crate::types::{ConnectReply, HostPort, Metadata, Network, Proto, ProxyStream, TcpContext};
use crate::waitgroup::WorkGuard;

pub const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
/// Longest identd user / hostname we will read before calling the request
/// malformed.
const MAX_FIELD: usize = 255;

pub async fn handle(
    mut conn: ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: Arc<Config>,
    guard: WorkGuard,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let dest = match handshake(&mut conn, id, src, &cfg).await {
        Ok(dest) => dest,
        Err(err) => {
            error!(%id, %src, %err, "socks4 handshake failed");
            return Err(err);
        }
    };
    let metadata = Metadata {
        id,
        network: Network::Tcp,
        proto: Proto::Socks4,
        src: HostPort::from(src),
        dest,
    };
    dispatcher.submit(TcpContext {
        conn,
        metadata,
        line: String::new(),
        reply: Some(ConnectReply::Socks4),
        guard,
        cfg,
    });
    Ok(())
}

async fn handshake(
    conn: &mut ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: &Config,
) -> Result<HostPort> {
    let mut head = [0u8; 8];
    conn.read_exact(&mut head).await?;
    let command = head[1];
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);
    info!(%id, %src, command, "socks4 request");

    if command != CMD_CONNECT {
        conn.write_all(&[0x00, 0x5B]).await?;
        return Err(Error::Handshake(format!("unsupported socks4 command {command}")));
    }

    let user = read_nul_terminated(conn).await?;
    if auth::user_enabled(cfg) && !auth::verify_user(cfg, &user, "", src.ip()) {
        // Historical reject bytes, kept for compatibility with deployed
        // clients (not the RFC's 00 5D).
        conn.write_all(&[0x01, 0x00]).await?;
        return Err(Error::AuthDeniedUser(user));
    }

    // socks4a: 0.0.0.x marks a hostname after the user field.
    let octets = ip.octets();
    let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
        read_nul_terminated(conn).await?
    } else {
        ip.to_string()
    };

    Ok(HostPort::new(host, port))
}

async fn read_nul_terminated(conn: &mut ProxyStream) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let b = conn.read_u8().await?;
        if b == 0 {
            break;
        }
        if out.len() >= MAX_FIELD {
            return Err(Error::Handshake("unterminated socks4 field".into()));
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| Error::Handshake("socks4 field is not utf-8".into()))
}
