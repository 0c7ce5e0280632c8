//! Proxy selection policy
//!
//! `select` is a pure function of (destination, config): no I/O, no global
//! state, so the policy is independently testable. Precedence: local bypass,
//! then black list, then white list, then mode.

use crate::config::{ProxyConfig, ProxyMode};
use fnv::FnvHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Which upstream transport carries a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Direct,
    Socks5,
    HttpProxy,
    /// No usable upstream under the configured mode
    Reject,
}

/// A loopback or unspecified destination is considered local.
pub fn is_local(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

/// Decide the upstream for `dest` under `config`.
pub fn select(dest: SocketAddr, config: &ProxyConfig) -> Decision {
    let ip = dest.ip();

    if config.bypass_local && is_local(ip) {
        return Decision::Direct;
    }

    // Black-listed destinations never go through a proxy, whatever the mode
    if config.blacklist.contains(ip) {
        return Decision::Direct;
    }

    // With a white list, only listed destinations are proxied
    if !config.whitelist.is_empty() && !config.whitelist.contains(ip) {
        return Decision::Direct;
    }

    match config.mode {
        ProxyMode::Direct => Decision::Direct,
        ProxyMode::OnlySocks5 => {
            if config.socks5.is_some() {
                Decision::Socks5
            } else {
                Decision::Reject
            }
        }
        ProxyMode::OnlyHttpProxy => {
            if config.http_proxy.is_some() {
                Decision::HttpProxy
            } else {
                Decision::Reject
            }
        }
        ProxyMode::Random => {
            let mut candidates = Vec::with_capacity(2);
            if config.socks5.is_some() {
                candidates.push(Decision::Socks5);
            }
            if config.http_proxy.is_some() {
                candidates.push(Decision::HttpProxy);
            }
            if candidates.is_empty() {
                return Decision::Direct;
            }
            // Hash the destination instead of rolling a die: uniform over
            // destinations, yet repeatable for any single one, so retries of
            // the same connect land on the same upstream.
            candidates[(dest_hash(&dest) as usize) % candidates.len()]
        }
        ProxyMode::Auto => {
            if config.socks5.is_some() {
                Decision::Socks5
            } else if config.http_proxy.is_some() {
                Decision::HttpProxy
            } else {
                Decision::Direct
            }
        }
    }
}

/// The single alternate upstream a failed connect may retry, allowed only
/// under `auto` and `random`.
pub fn fallback(decision: Decision, config: &ProxyConfig) -> Option<Decision> {
    if !matches!(config.mode, ProxyMode::Auto | ProxyMode::Random) {
        return None;
    }
    match decision {
        Decision::Socks5 if config.http_proxy.is_some() => Some(Decision::HttpProxy),
        Decision::HttpProxy if config.socks5.is_some() => Some(Decision::Socks5),
        _ => None,
    }
}

fn dest_hash(dest: &SocketAddr) -> u64 {
    let mut hasher = FnvHasher::default();
    dest.ip().hash(&mut hasher);
    dest.port().hash(&mut hasher);
    hasher.finish()
}
