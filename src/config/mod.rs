//! Configuration module
//!
//! `ProxyConfig` is assembled once at startup (from CLI flags and an
//! optional YAML file) and is read-only afterwards; every component that
//! needs it receives an `Arc<ProxyConfig>`.

use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default bound on waiting for the destination notification of an
/// accepted connection.
pub const DEFAULT_CORRELATION_WAIT: Duration = Duration::from_secs(5);

/// Default lifetime of an unmatched registry entry.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(30);

/// Proxy selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Prefer SOCKS5, fall back to HTTP proxy, then direct
    #[default]
    Auto,
    /// Spread destinations over the configured upstreams
    Random,
    /// HTTP CONNECT proxy only
    OnlyHttpProxy,
    /// SOCKS5 only
    OnlySocks5,
    /// Never proxy
    Direct,
}

impl TryFrom<&str> for ProxyMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ProxyMode::Auto),
            "random" => Ok(ProxyMode::Random),
            "only_http_proxy" => Ok(ProxyMode::OnlyHttpProxy),
            "only_socks5" => Ok(ProxyMode::OnlySocks5),
            "direct" => Ok(ProxyMode::Direct),
            _ => Err(Error::config(format!("Unknown proxy mode: {}", s))),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Auto => write!(f, "auto"),
            ProxyMode::Random => write!(f, "random"),
            ProxyMode::OnlyHttpProxy => write!(f, "only_http_proxy"),
            ProxyMode::OnlySocks5 => write!(f, "only_socks5"),
            ProxyMode::Direct => write!(f, "direct"),
        }
    }
}

/// SOCKS5 username/password credentials (RFC 1929)
#[derive(Debug, Clone)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

/// A set of IP networks loaded from a black/white list file.
///
/// One IP or CIDR per line; `#` comments and blank lines are ignored. A
/// bare IP is widened to a host network (/32 or /128).
#[derive(Debug, Clone, Default)]
pub struct IpList {
    nets: Vec<IpNet>,
}

impl IpList {
    pub fn new() -> Self {
        IpList { nets: Vec::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content).map_err(|e| {
            Error::config(format!("{}: {}", path.as_ref().display(), e))
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut nets = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let net = if let Ok(net) = line.parse::<IpNet>() {
                net
            } else if let Ok(ip) = line.parse::<IpAddr>() {
                IpNet::from(ip)
            } else {
                return Err(Error::config(format!(
                    "line {}: invalid IP or CIDR: {}",
                    lineno + 1,
                    line
                )));
            };
            nets.push(net);
        }
        Ok(IpList { nets })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}

/// Dispatcher proxy configuration; never mutated after load
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Selection mode
    pub mode: ProxyMode,

    /// SOCKS5 upstream address
    pub socks5: Option<SocketAddr>,

    /// SOCKS5 credentials
    pub socks5_auth: Option<Socks5Auth>,

    /// HTTP CONNECT proxy address
    pub http_proxy: Option<SocketAddr>,

    /// Destinations that must never go through a proxy
    pub blacklist: IpList,

    /// If non-empty, only these destinations are proxied
    pub whitelist: IpList,

    /// Connect loopback destinations directly regardless of mode
    pub bypass_local: bool,

    /// How long an accepted connection waits for its notification
    pub correlation_wait: Duration,

    /// Lifetime of an unmatched notification in the registry
    pub entry_ttl: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            mode: ProxyMode::Auto,
            socks5: None,
            socks5_auth: None,
            http_proxy: None,
            blacklist: IpList::new(),
            whitelist: IpList::new(),
            bypass_local: true,
            correlation_wait: DEFAULT_CORRELATION_WAIT,
            entry_ttl: DEFAULT_ENTRY_TTL,
        }
    }
}

impl ProxyConfig {
    /// Validate mode against the configured upstreams.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            ProxyMode::OnlySocks5 if self.socks5.is_none() => Err(Error::config(
                "mode only_socks5 requires a SOCKS5 address",
            )),
            ProxyMode::OnlyHttpProxy if self.http_proxy.is_none() => Err(Error::config(
                "mode only_http_proxy requires an HTTP proxy address",
            )),
            _ => Ok(()),
        }
    }
}

/// On-disk configuration file (YAML), merged under CLI flags
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// Proxy selection mode
    #[serde(rename = "select-proxy-mode")]
    pub select_proxy_mode: Option<String>,

    /// SOCKS5 address, e.g. 127.0.0.1:1080
    pub socks5: Option<String>,

    #[serde(rename = "socks5-username")]
    pub socks5_username: Option<String>,

    #[serde(rename = "socks5-password")]
    pub socks5_password: Option<String>,

    /// HTTP proxy address, e.g. 127.0.0.1:8080
    #[serde(rename = "http-proxy")]
    pub http_proxy: Option<String>,

    #[serde(rename = "blackip-file")]
    pub blackip_file: Option<String>,

    #[serde(rename = "whiteip-file")]
    pub whiteip_file: Option<String>,

    #[serde(rename = "not-ignore-local")]
    pub not_ignore_local: Option<bool>,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

fn parse_addr(which: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| Error::config(format!("invalid {} address: {}", which, addr)))
}

impl ProxyConfig {
    /// Build the final config from a file config (CLI overrides are applied
    /// by the caller before this point).
    pub fn from_file_config(file: &FileConfig) -> Result<Self> {
        let mut config = ProxyConfig::default();

        if let Some(ref mode) = file.select_proxy_mode {
            config.mode = ProxyMode::try_from(mode.as_str())?;
        }
        if let Some(ref addr) = file.socks5 {
            config.socks5 = Some(parse_addr("SOCKS5", addr)?);
        }
        if let (Some(user), Some(pass)) = (&file.socks5_username, &file.socks5_password) {
            config.socks5_auth = Some(Socks5Auth {
                username: user.clone(),
                password: pass.clone(),
            });
        }
        if let Some(ref addr) = file.http_proxy {
            config.http_proxy = Some(parse_addr("HTTP proxy", addr)?);
        }
        if let Some(ref path) = file.blackip_file {
            config.blacklist = IpList::load(path)?;
        }
        if let Some(ref path) = file.whiteip_file {
            config.whitelist = IpList::load(path)?;
        }
        if let Some(not_ignore) = file.not_ignore_local {
            config.bypass_local = !not_ignore;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(ProxyMode::try_from("auto").unwrap(), ProxyMode::Auto);
        assert_eq!(
            ProxyMode::try_from("only_socks5").unwrap(),
            ProxyMode::OnlySocks5
        );
        assert_eq!(
            ProxyMode::try_from("ONLY_HTTP_PROXY").unwrap(),
            ProxyMode::OnlyHttpProxy
        );
        assert_eq!(ProxyMode::try_from("direct").unwrap(), ProxyMode::Direct);
        assert!(ProxyMode::try_from("socks4").is_err());
    }

    #[test]
    fn test_ip_list_parse() {
        let list = IpList::parse("# comment\n10.0.0.0/8\n\n192.168.1.1\n").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(list.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!list.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))));
    }

    #[test]
    fn test_ip_list_rejects_garbage() {
        assert!(IpList::parse("not-an-ip\n").is_err());
    }

    #[test]
    fn test_validate_requires_configured_upstream() {
        let config = ProxyConfig {
            mode: ProxyMode::OnlySocks5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            mode: ProxyMode::OnlySocks5,
            socks5: Some("127.0.0.1:1080".parse().unwrap()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_config_yaml() {
        let yaml = r#"
select-proxy-mode: only_socks5
socks5: 127.0.0.1:1080
not-ignore-local: true
"#;
        let file: FileConfig = serde_yaml::from_str(yaml).unwrap();
        let config = ProxyConfig::from_file_config(&file).unwrap();
        assert_eq!(config.mode, ProxyMode::OnlySocks5);
        assert_eq!(config.socks5, Some("127.0.0.1:1080".parse().unwrap()));
        assert!(!config.bypass_local);
    }
}
