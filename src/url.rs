//! Server address parsing for `--addr`

use crate::protocol::DEFAULT_PORT;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Accepts `host`, `host:port`, `[v6]:port`, `rdeploy://host[:port][/...]`
/// and `ws://host[:port][/...]`. Port defaults to 8081.
pub fn parse_server_addr(s: &str) -> Option<ServerAddr> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let mut rest = s_trim;
    if let Some(idx) = lower.find("://") {
        let scheme = &lower[..idx];
        if scheme != "rdeploy" && scheme != "ws" {
            return None;
        }
        rest = &s_trim[idx + 3..];
    }
    let (hp, _path) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }

    if let Some(v6) = hp.strip_prefix('[') {
        let (host, after) = v6.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        return Some(ServerAddr {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match hp.split_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(ServerAddr { host, port })
}
