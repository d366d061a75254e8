//! PROXY protocol v1/v2 support on inbound listeners, so a front load
//! balancer can hand over the real client address. The header, when present,
//! is consumed from the peek buffer before dispatch; the declared source
//! address replaces the TCP peer for authentication and metadata.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncRead;

use crate::peek::BufferedStream;

const V1_SIGNATURE: &[u8] = b"PROXY ";
/// A v1 line is at most 107 bytes including CRLF.
const V1_MAX_LINE: usize = 107;
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Consume a PROXY protocol header if one leads the stream and return the
/// declared source address. Returns `None` when no header is present (the
/// stream is untouched) or when the header declares no usable address
/// (v1 `UNKNOWN`, v2 `LOCAL`).
pub async fn strip_proxy_header<S>(
    conn: &mut BufferedStream<S>,
) -> io::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let head = conn.peek(1).await?;
    match head[0] {
        b'P' => try_v1(conn).await,
        0x0D => try_v2(conn).await,
        _ => Ok(None),
    }
}

async fn try_v1<S>(conn: &mut BufferedStream<S>) -> io::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    // "PROXY" also prefixes no HTTP method, but check the full signature
    // before committing: "POST" and "PUT" share only the first byte.
    if conn.peek(V1_SIGNATURE.len()).await? != V1_SIGNATURE {
        return Ok(None);
    }
    let mut line_len = None;
    for n in V1_SIGNATURE.len() + 1..=V1_MAX_LINE {
        let window = conn.peek(n).await?;
        if window[n - 2..] == *b"\r\n" {
            line_len = Some(n);
            break;
        }
    }
    let Some(line_len) = line_len else {
        return Err(malformed("proxy protocol v1 line too long"));
    };
    let line = std::str::from_utf8(&conn.peek(line_len).await?[..line_len - 2])
        .map_err(|_| malformed("proxy protocol v1 line is not ascii"))?;

    // PROXY TCP4 <src> <dst> <sport> <dport> | PROXY UNKNOWN ...
    let fields: Vec<&str> = line.split(' ').collect();
    let src = match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => None,
        ["PROXY", "TCP4" | "TCP6", src, _dst, sport, _dport] => {
            let ip: IpAddr = src.parse().map_err(|_| malformed("bad v1 source ip"))?;
            let port: u16 = sport.parse().map_err(|_| malformed("bad v1 source port"))?;
            Some(SocketAddr::new(ip, port))
        }
        _ => return Err(malformed("bad proxy protocol v1 line")),
    };
    conn.discard(line_len);
    Ok(src)
}

async fn try_v2<S>(conn: &mut BufferedStream<S>) -> io::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    if conn.peek(V2_SIGNATURE.len()).await? != V2_SIGNATURE {
        return Ok(None);
    }
    let head = conn.peek(16).await?;
    let ver_cmd = head[12];
    let family = head[13];
    let addr_len = u16::from_be_bytes([head[14], head[15]]) as usize;
    if ver_cmd >> 4 != 0x2 {
        return Err(malformed("bad proxy protocol v2 version"));
    }
    let total = 16 + addr_len;
    let body = &conn.peek(total).await?[16..];

    let src = match (ver_cmd & 0x0F, family) {
        // LOCAL: health checks, no address to report
        (0x0, _) => None,
        // PROXY over TCP/UDP on INET
        (0x1, 0x11 | 0x12) if addr_len >= 12 => {
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        // PROXY over TCP/UDP on INET6
        (0x1, 0x21 | 0x22) if addr_len >= 36 => {
            let mut oct = [0u8; 16];
            oct.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(oct)), port))
        }
        (0x1, 0x00) => None, // AF_UNSPEC
        _ => return Err(malformed("bad proxy protocol v2 address block")),
    };
    conn.discard(total);
    Ok(src)
}

fn malformed(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}
