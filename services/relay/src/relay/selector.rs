//! Backend selection.
//!
//! With a single configured backend every connection dials the same endpoint.
//! With two or more the selector rotates: each call pops the address at the
//! front of the pool, pushes it to the back and returns it. The order is
//! strictly cyclic, so consecutive connections never share a backend and
//! long-run usage is uniform.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ConfigError, RelayError};

/// A backend endpoint as configured (host name or IP literal plus port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    host: String,
    port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse one configured entry.
    ///
    /// Accepted forms: `host`, `ip`, `[ipv6]`, `host:port`, `ipv4:port` and
    /// `[ipv6]:port`. Entries without a port get `default_port`.
    pub fn parse(entry: &str, default_port: u16) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        if entry.is_empty() {
            return Err(invalid("empty entry"));
        }
        if entry.contains(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        if let Ok(addr) = entry.parse::<SocketAddr>() {
            if addr.port() == 0 {
                return Err(invalid("port must be between 1 and 65535"));
            }
            return Ok(Self::new(addr.ip().to_string(), addr.port()));
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), default_port));
        }
        if let Some(inner) = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
            let ip: Ipv6Addr = inner.parse().map_err(|_| invalid("bad IPv6 literal"))?;
            return Ok(Self::new(ip.to_string(), default_port));
        }

        match entry.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
                if port == 0 {
                    return Err(invalid("port must be between 1 and 65535"));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(entry, default_port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Dial this backend, giving up after `connect_timeout`.
    ///
    /// Nagle is disabled on the returned stream so small writes are sent as
    /// they are issued.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream, RelayError> {
        debug!(backend = %self, "Connecting to backend");

        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RelayError::Dial {
                    backend: self.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(RelayError::DialTimeout {
                    backend: self.clone(),
                    timeout: connect_timeout,
                })
            }
        };

        stream.set_nodelay(true).map_err(|source| RelayError::Dial {
            backend: self.clone(),
            source,
        })?;
        Ok(stream)
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Round-robin pool of backends.
pub struct RotatingPool {
    ring: Mutex<Ring>,
}

/// Pool order: `front` is dispatched next, then `rest` in order.
struct Ring {
    front: BackendAddr,
    rest: VecDeque<BackendAddr>,
}

impl RotatingPool {
    /// Create a pool. An empty address list is a configuration error.
    pub fn new(addrs: Vec<BackendAddr>) -> Result<Self, ConfigError> {
        let mut rest = VecDeque::from(addrs);
        let front = rest.pop_front().ok_or(ConfigError::EmptyBackendPool)?;
        Ok(Self {
            ring: Mutex::new(Ring { front, rest }),
        })
    }

    /// Rotate the pool by one and return the address that was at the front.
    pub async fn next(&self) -> BackendAddr {
        let mut ring = self.ring.lock().await;
        match ring.rest.pop_front() {
            Some(next) => {
                let current = mem::replace(&mut ring.front, next);
                ring.rest.push_back(current.clone());
                current
            }
            None => ring.front.clone(),
        }
    }

    /// Current order, front first.
    pub async fn snapshot(&self) -> Vec<BackendAddr> {
        let ring = self.ring.lock().await;
        std::iter::once(&ring.front)
            .chain(ring.rest.iter())
            .cloned()
            .collect()
    }
}

/// Picks the backend for each new connection.
pub enum BackendSelector {
    /// Single fixed endpoint.
    Static(BackendAddr),
    /// Round-robin over two or more endpoints.
    Rotating(RotatingPool),
}

impl BackendSelector {
    /// Build a selector from the configured addresses.
    ///
    /// One address gives a static selector, several give a rotating one and
    /// none is an error.
    pub fn from_addrs(mut addrs: Vec<BackendAddr>) -> Result<Self, ConfigError> {
        match addrs.len() {
            0 => Err(ConfigError::EmptyBackendPool),
            1 => Ok(Self::Static(addrs.remove(0))),
            _ => Ok(Self::Rotating(RotatingPool::new(addrs)?)),
        }
    }

    /// The backend to dial for the next connection.
    pub async fn next(&self) -> BackendAddr {
        match self {
            Self::Static(addr) => addr.clone(),
            Self::Rotating(pool) => pool.next().await,
        }
    }

    pub fn is_rotating(&self) -> bool {
        matches!(self, Self::Rotating(_))
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(addr) => f.debug_tuple("Static").field(addr).finish(),
            Self::Rotating(_) => f.debug_tuple("Rotating").finish_non_exhaustive(),
        }
    }
}
