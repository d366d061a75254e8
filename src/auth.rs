use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

use crate::config::Config;

/// Gate on the global CIDR allowlist. An empty list admits everyone;
/// otherwise the client host must match a literal IP or CIDR entry.
pub fn verify_ip(cfg: &Config, addr: IpAddr) -> bool {
    if cfg.cidr.is_empty() {
        return true;
    }
    verify_cidr(addr, &cfg.cidr)
}

fn verify_cidr(src: IpAddr, list: &[String]) -> bool {
    for entry in list {
        if let Ok(ip) = entry.parse::<IpAddr>() {
            if ip == src {
                return true;
            }
        } else if let Ok(net) = entry.parse::<IpNet>() {
            if net.contains(&src) {
                return true;
            }
        } else {
            warn!(entry, "unparseable allowlist entry");
        }
    }
    false
}

/// True when a user table is configured; handshakes then demand credentials.
pub fn user_enabled(cfg: &Config) -> bool {
    !cfg.users.is_empty()
}

/// Check a username/password pair from a handshake. The user must exist;
/// when both a recorded and a supplied password are present they must match;
/// a per-user CIDR list additionally pins the client host.
pub fn verify_user(cfg: &Config, username: &str, password: &str, addr: IpAddr) -> bool {
    let Some(user) = cfg.users.iter().find(|u| u.username == username) else {
        return false;
    };
    if !user.password.is_empty() && !password.is_empty() && user.password != password {
        return false;
    }
    if user.cidr.is_empty() {
        return true;
    }
    verify_cidr(addr, &user.cidr)
}
