//! Host identity for per-host state (breakers, metrics, slot semaphores).

use anyhow::{Context, Result};
use std::fmt;

/// Identity of a remote host: `(scheme, host, port)`.
///
/// Two URLs that differ only in path share the same key, so they share a
/// breaker, a metrics row, and a connection semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    /// Parse a URL into a host key. Missing ports use the scheme default.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
        let host = parsed
            .host_str()
            .with_context(|| format!("URL has no host: {}", url))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .with_context(|| format!("URL has no port or known default: {}", url))?;
        Ok(HostKey {
            scheme: parsed.scheme().to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
