//! YAML configuration with hot reload.
//!
//! The file is parsed into an immutable [`Config`] snapshot behind an
//! [`ArcSwap`]; a `notify` watcher re-parses on every write and swaps the
//! pointer. Accepted connections clone the `Arc` once and never observe a
//! reload mid-flight. A reload that fails to parse keeps the previous
//! snapshot.

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address for the mixed or server listener.
    pub local: Endpoint,
    /// Paired remote instance; empty host or zero port means Direct mode.
    pub server: Endpoint,
    /// REST control plane; zero port disables it.
    pub api: Endpoint,
    pub tls: Tls,
    /// Outbound dial deadline, also the UDP session idle bound.
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    /// Global allowlist of literal IPs and CIDR blocks; empty admits all.
    pub cidr: Vec<String>,
    /// Proxy credentials; a non-empty table switches handshakes to
    /// authenticated mode.
    pub users: Vec<User>,
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local: Endpoint::default(),
            server: Endpoint::default(),
            api: Endpoint::default(),
            tls: Tls::default(),
            timeout: DEFAULT_TIMEOUT,
            cidr: Vec::new(),
            users: Vec::new(),
            log: Log::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Tls {
    pub enable: bool,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub password: String,
    pub cidr: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub filename: String,
    pub level: String,
    pub maxbackups: u32,
    pub maxsize: u64,
    pub maxage: u32,
    pub compress: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            filename: String::new(),
            level: "info".into(),
            maxbackups: 7,
            maxsize: 500,
            maxage: 28,
            compress: true,
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl Config {
    fn parse(raw: &str) -> Result<Self, Error> {
        let cfg: Config =
            serde_yaml::from_str(raw).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.local.port == 0 {
            return Err(Error::ConfigInvalid("local.port must be set".into()));
        }
        Ok(())
    }

    /// True when no paired server is configured, which forces Direct mode.
    pub fn server_unset(&self) -> bool {
        self.server.host.is_empty() || self.server.port == 0
    }
}

/// Shared handle on the current config snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
    path: PathBuf,
}

impl ConfigHandle {
    /// Load the file once; a parse or validation failure here is fatal.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let cfg = Config::parse(&raw)?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(cfg)),
            path: path.to_path_buf(),
        })
    }

    /// Handle around a fixed config, for tests and embedded use.
    pub fn for_tests(cfg: Config) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(cfg)),
            path: PathBuf::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Re-read the file and swap the snapshot; keeps the old one on failure.
    pub fn reload(&self) {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "config reload failed");
                return;
            }
        };
        match Config::parse(&raw) {
            Ok(cfg) => {
                self.inner.store(Arc::new(cfg));
                info!(path = %self.path.display(), "config file reloaded");
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "config reload failed, keeping previous");
            }
        }
    }

    /// Watch the file and reload on every write. The watcher lives on a
    /// plain thread; events funnel through a std channel.
    pub fn spawn_watcher(&self) -> notify::Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        let handle = self.clone();
        std::thread::spawn(move || {
            // the watcher must outlive the loop
            let _watcher = watcher;
            for event in rx {
                match event {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        handle.reload();
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "config watcher error"),
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
local:
  host: 0.0.0.0
  port: 1080
  token: local-secret
server:
  host: relay.example.com
  port: 8443
  token: remote-secret
api:
  host: 127.0.0.1
  port: 9090
  token: api-secret
tls:
  enable: false
timeout: 45s
cidr:
  - 10.0.0.0/8
  - 192.0.2.7
users:
  - username: alice
    password: pw
    cidr: [10.0.0.0/8]
log:
  level: debug
"#;

    #[test]
    fn parses_a_full_config() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.local.port, 1080);
        assert_eq!(cfg.server.host, "relay.example.com");
        assert_eq!(cfg.timeout, Duration::from_secs(45));
        assert_eq!(cfg.cidr.len(), 2);
        assert_eq!(cfg.users[0].username, "alice");
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.log.maxbackups, 7);
        assert!(!cfg.server_unset());
    }

    #[test]
    fn missing_server_means_direct_mode() {
        let cfg = Config::parse("local: {host: 127.0.0.1, port: 1080}\n").unwrap();
        assert!(cfg.server_unset());
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn rejects_a_config_without_a_listen_port() {
        assert!(matches!(
            Config::parse("local: {host: 127.0.0.1}\n"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn reload_failure_keeps_the_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"local: {host: 127.0.0.1, port: 1080, token: a}\n")
            .unwrap();
        file.flush().unwrap();

        let handle = ConfigHandle::load(file.path()).unwrap();
        assert_eq!(handle.snapshot().local.token, "a");

        std::fs::write(file.path(), b"local: {port: [broken\n").unwrap();
        handle.reload();
        assert_eq!(handle.snapshot().local.token, "a");

        std::fs::write(file.path(), b"local: {host: 127.0.0.1, port: 1080, token: b}\n")
            .unwrap();
        handle.reload();
        assert_eq!(handle.snapshot().local.token, "b");
    }

    #[test]
    fn snapshots_are_isolated_from_reloads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"local: {host: 127.0.0.1, port: 1080, token: old}\n")
            .unwrap();
        file.flush().unwrap();

        let handle = ConfigHandle::load(file.path()).unwrap();
        let before = handle.snapshot();
        std::fs::write(file.path(), b"local: {host: 127.0.0.1, port: 1080, token: new}\n")
            .unwrap();
        handle.reload();
        // the old snapshot still reads the values it started with
        assert_eq!(before.local.token, "old");
        assert_eq!(handle.snapshot().local.token, "new");
    }
}
