use crate::error::ProxyError;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::{Host, Url};

pub const DEFAULT_PORT: u16 = 80;

/// Where a request is headed: upstream host, port and the path sent in the
/// rewritten request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TargetAddress {
    /// Parses a target reference. The scheme is optional (`http://` is assumed);
    /// a missing port means 80.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let target = target.trim();
        let url = if split_scheme(target).0.is_some() {
            Url::parse(target)
        } else {
            Url::parse(&format!("http://{}", target))
        }
        .map_err(|e| ProxyError::UnresolvedHost(format!("{}: {}", target, e)))?;

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ProxyError::UnresolvedHost(target.to_string())),
        };

        // Url drops a port equal to the scheme default, so recover it when it
        // was written out explicitly.
        let port = match url.port() {
            Some(p) => p,
            None if authority_has_port(target) => {
                url.port_or_known_default().unwrap_or(DEFAULT_PORT)
            }
            None => DEFAULT_PORT,
        };

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self { host, port, path })
    }

    /// Opens the upstream connection. Refused connections are reported apart
    /// from every other failure.
    pub async fn connect(
        &self,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, ProxyError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ProxyError::UnresolvedHost(format!("{}: {}", self.host, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(ProxyError::UnresolvedHost(self.host.clone()));
        }

        let mut refused = false;

        for addr in addrs {
            let attempt = TcpStream::connect(addr);
            let result = match connect_timeout {
                Some(limit) => match timeout(limit, attempt).await {
                    Ok(r) => r,
                    Err(_) => {
                        debug!("Upstream timeout {}", addr);
                        continue;
                    }
                },
                None => attempt.await,
            };

            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Upstream connect failed {}: {}", addr, e);
                    refused |= e.kind() == ErrorKind::ConnectionRefused;
                }
            }
        }

        if refused {
            Err(ProxyError::UpstreamRefused(self.to_string()))
        } else {
            Err(ProxyError::UnresolvedHost(self.to_string()))
        }
    }

    /// Request line plus the client's raw header block, as sent upstream.
    pub fn upstream_request(&self, headers: &[u8]) -> Vec<u8> {
        let line = format!("GET {} HTTP/1.0\r\n", self.path);
        let mut request = Vec::with_capacity(line.len() + headers.len() + 2);
        request.extend_from_slice(line.as_bytes());
        request.extend_from_slice(headers);
        request.extend_from_slice(b"\r\n");
        request
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses and connects in one step.
pub async fn resolve(
    target: &str,
    connect_timeout: Option<Duration>,
) -> Result<(TargetAddress, TcpStream), ProxyError> {
    let address = TargetAddress::parse(target)?;
    let stream = address.connect(connect_timeout).await?;
    Ok((address, stream))
}

/// Splits off a leading `scheme://`. A `://` after the first `/`, `?` or `#`
/// belongs to the path or query, not to a scheme.
fn split_scheme(target: &str) -> (Option<&str>, &str) {
    let Some(at) = target.find("://") else {
        return (None, target);
    };

    match target.find(['/', '?', '#']) {
        Some(first) if first < at => (None, target),
        _ => (Some(&target[..at]), &target[at + 3..]),
    }
}

fn authority_has_port(target: &str) -> bool {
    let rest = split_scheme(target).1;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    match host_port.rfind(']') {
        Some(end) => host_port[end..].contains(':'),
        None => host_port.contains(':'),
    }
}
