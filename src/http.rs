//! HTTP proxy handshake: CONNECT tunneling and plain forward-proxy requests
//! on the same port. Forward requests get their request line rewritten to the
//! path-only form and their `Proxy-*` headers stripped; the rebuilt block is
//! replayed to the origin by the worker once the dial lands.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
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
use crate::waitgroup::WorkGuard;

/// Upper bound on the request head. Requests whose headers have not
/// terminated by then are rejected rather than silently truncated.
const MAX_HEADER: usize = 4096;

const METHOD_CONNECT: &str = "CONNECT";
const PROXY_AUTHORIZATION: &str = "Proxy-Authorization: Basic ";

pub async fn handle(
    mut conn: ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: Arc<Config>,
    guard: WorkGuard,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let head = match read_head(&mut conn).await {
        Ok(head) => head,
        Err(err) => {
            error!(%id, %src, %err, "http request head unreadable");
            return Err(err);
        }
    };
    let lines: Vec<&str> = head.split("\r\n").collect();
    if lines[0].trim().is_empty() {
        return Err(Error::Handshake("request line error".into()));
    }

    if let Err(err) = check_auth(&mut conn, id, src, &cfg, &lines).await {
        error!(%id, %src, %err, "http handshake failed");
        return Err(err);
    }

    let request_line: Vec<&str> = lines[0].split(' ').collect();
    let [method, target, version] = request_line.as_slice() else {
        return Err(Error::Handshake("request line error".into()));
    };

    if *method == METHOD_CONNECT {
        let Some(dest) = HostPort::parse(target) else {
            return Err(Error::Handshake(format!("bad CONNECT target {target}")));
        };
        info!(%id, %src, dest = %dest, "http connect request");
        let metadata = Metadata {
            id,
            network: Network::Tcp,
            proto: Proto::HttpConnect,
            src: HostPort::from(src),
            dest,
        };
        dispatcher.submit(TcpContext {
            conn,
            metadata,
            line: String::new(),
            reply: Some(ConnectReply::HttpConnect),
            guard,
            cfg,
        });
        return Ok(());
    }

    // Forward proxy: absolute-form target, default port 80.
    let Some(rest) = target.split_once("//").map(|(_, rest)| rest).filter(|r| !r.is_empty())
    else {
        conn.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await?;
        return Err(Error::Handshake(format!("bad forward target {target}")));
    };
    let (host_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let dest = HostPort::parse(host_port)
        .or_else(|| Some(HostPort::new(host_port, 80)))
        .filter(|hp| !hp.host.is_empty())
        .ok_or_else(|| Error::Handshake(format!("bad forward target {target}")))?;

    let line = rewrite_request(method, path, version, &lines[1..]);
    info!(%id, %src, dest = %dest, "http forward request");
    let metadata = Metadata {
        id,
        network: Network::Tcp,
        proto: Proto::Http,
        src: HostPort::from(src),
        dest,
    };
    dispatcher.submit(TcpContext {
        conn,
        metadata,
        line,
        reply: None,
        guard,
        cfg,
    });
    Ok(())
}

/// Read up to and including the `\r\n\r\n` terminator, byte by byte so no
/// body bytes are consumed, bounded at [`MAX_HEADER`].
async fn read_head(conn: &mut ProxyStream) -> Result<String> {
    let mut raw = Vec::with_capacity(512);
    loop {
        let b = conn.read_u8().await?;
        raw.push(b);
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
        if raw.len() >= MAX_HEADER {
            return Err(Error::Handshake("request head exceeds 4 KiB".into()));
        }
    }
    raw.truncate(raw.len() - 4);
    String::from_utf8(raw).map_err(|_| Error::Handshake("request head is not utf-8".into()))
}

async fn check_auth(
    conn: &mut ProxyStream,
    id: Uuid,
    src: SocketAddr,
    cfg: &Config,
    lines: &[&str],
) -> Result<()> {
    let mut user = String::new();
    let mut pass = String::new();
    for line in lines {
        if let Some(b64) = line.strip_prefix(PROXY_AUTHORIZATION) {
            let Ok(decoded) = BASE64.decode(b64.trim()) else {
                continue;
            };
            let decoded = String::from_utf8_lossy(&decoded).into_owned();
            if let Some((u, p)) = decoded.split_once(':') {
                user = u.to_string();
                pass = p.to_string();
            }
        }
    }
    if !user.is_empty() {
        info!(%id, %src, user, "proxy credentials offered");
    }
    if auth::user_enabled(cfg) && !auth::verify_user(cfg, &user, &pass, src.ip()) {
        // Non-HTTP two-byte sentinel the paired clients expect on a reject.
        conn.write_all(&[0x00, 0xFF]).await?;
        return Err(Error::AuthDeniedUser(user));
    }
    Ok(())
}

/// Rebuild the first request block in origin form: path-only request line,
/// `Proxy-Authorization` dropped, the `Proxy-` prefix stripped elsewhere.
fn rewrite_request(method: &str, path: &str, version: &str, headers: &[&str]) -> String {
    let mut out = format!("{method} {path} {version}\r\n");
    for header in headers {
        if header.is_empty() || header.starts_with("Proxy-Authorization") {
            continue;
        }
        let header = header.strip_prefix("Proxy-").unwrap_or(header);
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}
