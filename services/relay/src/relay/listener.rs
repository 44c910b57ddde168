//! TCP listener and accept loop.
//!
//! The listener accepts client connections, stamps each one with its session
//! deadline, sleeps the accept delay and spawns a relay session for it. The
//! delay runs inside the loop, so it paces how fast new connections are
//! taken. Accept errors are logged and never end the loop.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::selector::BackendSelector;
use super::session::{Session, SessionConfig};

/// Default listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 2500;

/// Default pause after each accept.
pub const DEFAULT_ACCEPT_DELAY: Duration = Duration::from_millis(10);

/// Pause before retrying after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Pause after each accepted connection.
    pub accept_delay: Duration,
    /// Settings handed to every session.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a configuration with default timings.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            accept_delay: DEFAULT_ACCEPT_DELAY,
            session: SessionConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)))
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished, whatever the reason.
    pub connections_closed: AtomicU64,
    /// Accept calls that failed.
    pub accept_errors: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// The relay's listening socket.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    selector: Arc<BackendSelector>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, selector: Arc<BackendSelector>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            config,
            listener,
            selector,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the accept loop forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the accept loop until `shutdown` completes.
    ///
    /// Sessions already spawned keep running on their own.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => {
                    info!(bind_addr = %local_addr, "Listener stopping");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let accepted_at = Instant::now();
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(peer_addr = %peer_addr, "Connection accepted");

                    if !self.config.accept_delay.is_zero() {
                        tokio::time::sleep(self.config.accept_delay).await;
                    }

                    let session = Session::new(stream, peer_addr, accepted_at, self.config.session);
                    self.spawn_session(session, peer_addr);
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");
                    // Back off before accepting again
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn spawn_session(&self, session: Session, peer_addr: SocketAddr) {
        let selector = Arc::clone(&self.selector);
        let stats = Arc::clone(&self.stats);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(
            async move {
                match session.run(&selector).await {
                    Ok(summary) => {
                        stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                        stats
                            .bytes_to_backend
                            .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
                        stats
                            .bytes_from_backend
                            .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);
                        debug!(
                            backend = %summary.backend,
                            furthest = ?summary.furthest,
                            fragments = summary.fragments,
                            bytes_to_backend = summary.bytes_to_backend,
                            bytes_from_backend = summary.bytes_from_backend,
                            "Connection closed"
                        );
                    }
                    Err(e) => {
                        stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(reason = e.reason_code(), error = %e, "Backend dial failed");
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::selector::BackendAddr;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:2500");
        assert_eq!(config.accept_delay, Duration::from_millis(10));
        assert_eq!(config.session, SessionConfig::default());
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let selector = Arc::new(
            BackendSelector::from_addrs(vec![BackendAddr::new("127.0.0.1", 9)]).unwrap(),
        );
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Arc::new(Listener::bind(config, selector).await.unwrap());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&listener).run_until(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
