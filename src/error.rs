use std::io;
use thiserror::Error;

/// Framing failures on the tunnel envelope. Any of these closes the tunnel.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("short frame header")]
    Short,
    #[error("frame length {0} exceeds the 16 MiB limit")]
    Oversize(usize),
    #[error("frame payload is not decodable")]
    Decrypt,
    #[error("frame io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("accept: {0}")]
    Accept(io::Error),
    #[error("{0} access denied, not in allowed address group")]
    AuthDeniedIp(String),
    #[error("authentication failed for user {0:?}")]
    AuthDeniedUser(String),
    #[error("malformed handshake: {0}")]
    Handshake(String),
    #[error("couldn't find ip for {0}")]
    ResolveFailed(String),
    #[error("ip version error for {0}")]
    IpVersion(String),
    #[error("dial {0}: {1}")]
    DialFailed(String, io::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error(transparent)]
    Framing(#[from] FrameError),
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    #[error("shutdown timed out")]
    ShutdownTimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
