//! Per-connection relay session.
//!
//! A session walks `Accepted -> Dialing -> FirstForward -> SteadyForward ->
//! Closed`, dropping straight to `Closed` on any error:
//! - the first client read (up to 16 KiB) goes to the backend through the
//!   fragmenting writer
//! - later client reads (4 KiB) are forwarded unmodified
//! - backend-to-client traffic is copied unmodified by a second task started
//!   as soon as the dial succeeds
//!
//! The two directions only meet at teardown. When either one ends it shuts
//! down the write half it owns and drops its end of the teardown link, which
//! stops the other direction; the session waits for both before its sockets
//! are dropped. Every read and write on either socket is bounded by one
//! absolute deadline taken at accept time.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn, Instrument};

use super::fragment::{send_fragmented, FragmentConfig};
use super::selector::{BackendAddr, BackendSelector};
use crate::error::RelayError;

/// Buffer for the first client read; large enough for a full ClientHello.
pub const FIRST_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Buffer for every other read, in both directions.
pub const STEADY_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Default session lifetime and dial timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pause before the first client read.
pub const DEFAULT_FIRST_READ_DELAY: Duration = Duration::from_millis(10);

/// Tunables for a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Session deadline measured from accept, also used as the dial timeout.
    pub socket_timeout: Duration,
    /// Pause before the first client read.
    pub first_read_delay: Duration,
    /// How the first client read is split.
    pub fragment: FragmentConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            first_read_delay: DEFAULT_FIRST_READ_DELAY,
            fragment: FragmentConfig::default(),
        }
    }
}

/// Traffic direction, used to tag log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("UPSTREAM"),
            Direction::Downstream => f.write_str("DOWNSTREAM"),
        }
    }
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Accepted,
    Dialing,
    FirstForward,
    SteadyForward,
    Closed,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Backend the session was relayed to.
    pub backend: BackendAddr,
    /// Last state reached before `Closed`.
    pub furthest: SessionState,
    /// Chunks the first client read was split into (0 if it never arrived).
    pub fragments: usize,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Result of one direction's copy loop. Bytes are counted even on error.
#[derive(Debug)]
struct PumpOutcome {
    bytes: u64,
    result: Result<(), RelayError>,
}

/// One end of the link between the two directions of a session.
///
/// Dropping an end tells the other direction to stop.
struct Teardown {
    peer_done: oneshot::Receiver<()>,
    _done: oneshot::Sender<()>,
}

impl Teardown {
    fn pair() -> (Self, Self) {
        let (a_done, a_peer) = oneshot::channel();
        let (b_done, b_peer) = oneshot::channel();
        (
            Self {
                peer_done: b_peer,
                _done: a_done,
            },
            Self {
                peer_done: a_peer,
                _done: b_done,
            },
        )
    }
}

/// Tracks state transitions for one session.
struct StateTracker {
    peer_addr: SocketAddr,
    state: SessionState,
    furthest: SessionState,
    fragments: usize,
}

impl StateTracker {
    fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            state: SessionState::Accepted,
            furthest: SessionState::Accepted,
            fragments: 0,
        }
    }

    fn enter(&mut self, next: SessionState) {
        trace!(peer_addr = %self.peer_addr, from = ?self.state, to = ?next, "Session state");
        if next != SessionState::Closed {
            self.furthest = self.furthest.max(next);
        }
        self.state = next;
    }
}

/// One accepted client connection.
pub struct Session {
    client: TcpStream,
    peer_addr: SocketAddr,
    deadline: Instant,
    config: SessionConfig,
}

impl Session {
    /// Create a session for a client accepted at `accepted_at`.
    pub fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        accepted_at: Instant,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            peer_addr,
            deadline: accepted_at + config.socket_timeout,
            config,
        }
    }

    /// Absolute deadline for every I/O operation of this session.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Drive the session to completion.
    ///
    /// Returns an error only when the backend could not be dialed; transport
    /// errors after that are logged per direction and end the session
    /// normally. Both sockets are closed when this returns.
    pub async fn run(self, selector: &BackendSelector) -> Result<SessionSummary, RelayError> {
        let Session {
            client,
            peer_addr,
            deadline,
            config,
        } = self;
        let mut tracker = StateTracker::new(peer_addr);

        tracker.enter(SessionState::Dialing);
        let backend_addr = selector.next().await;
        let backend = match backend_addr.connect(config.socket_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracker.enter(SessionState::Closed);
                return Err(e);
            }
        };
        debug!(peer_addr = %peer_addr, backend = %backend_addr, "Connected to backend");

        let (mut client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = backend.into_split();
        let (upstream_link, downstream_link) = Teardown::pair();

        let downstream = tokio::spawn(
            pump_downstream(backend_read, client_write, deadline, downstream_link)
                .instrument(tracing::Span::current()),
        );

        let upstream = pump_upstream(
            &mut client_read,
            backend_write,
            deadline,
            &config,
            &mut tracker,
            upstream_link,
        )
        .await;
        log_outcome(Direction::Upstream, &upstream);

        let downstream = downstream.await.unwrap_or_else(|e| PumpOutcome {
            bytes: 0,
            result: Err(RelayError::Io(io::Error::other(e))),
        });
        log_outcome(Direction::Downstream, &downstream);

        tracker.enter(SessionState::Closed);
        drop(client_read);

        Ok(SessionSummary {
            backend: backend_addr,
            furthest: tracker.furthest,
            fragments: tracker.fragments,
            bytes_to_backend: upstream.bytes,
            bytes_from_backend: downstream.bytes,
        })
    }
}

/// Client-to-backend direction.
///
/// Runs until the client stream ends or the downstream direction stops, then
/// shuts down the backend write side and releases its end of the link.
async fn pump_upstream<R, W>(
    client: &mut R,
    mut backend: W,
    deadline: Instant,
    config: &SessionConfig,
    tracker: &mut StateTracker,
    mut link: Teardown,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0;
    let result = tokio::select! {
        result = forward_upstream(client, &mut backend, deadline, config, tracker, &mut bytes) => result,
        _ = &mut link.peer_done => {
            debug!(direction = %Direction::Upstream, "Stopped by downstream close");
            Ok(())
        }
    };
    let _ = with_deadline(deadline, backend.shutdown()).await;
    drop(link);
    PumpOutcome { bytes, result }
}

async fn forward_upstream<R, W>(
    client: &mut R,
    backend: &mut W,
    deadline: Instant,
    config: &SessionConfig,
    tracker: &mut StateTracker,
    bytes: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracker.enter(SessionState::FirstForward);
    if !config.first_read_delay.is_zero() {
        tokio::time::sleep(config.first_read_delay).await;
    }

    let mut first = vec![0u8; FIRST_READ_BUFFER_SIZE];
    let n = with_deadline(deadline, client.read(&mut first)).await?;
    if n == 0 {
        return Ok(());
    }

    let report = with_deadline(
        deadline,
        send_fragmented(&first[..n], backend, &config.fragment),
    )
    .await?;
    *bytes += n as u64;
    tracker.fragments = report.chunks;
    debug!(bytes = n, chunks = report.chunks, "First segment fragmented");

    tracker.enter(SessionState::SteadyForward);
    let mut buf = vec![0u8; STEADY_READ_BUFFER_SIZE];
    loop {
        let n = with_deadline(deadline, client.read(&mut buf)).await?;
        if n == 0 {
            return Ok(());
        }
        with_deadline(deadline, backend.write_all(&buf[..n])).await?;
        *bytes += n as u64;
    }
}

/// Backend-to-client direction.
///
/// Runs until the backend stream ends or the upstream direction stops, then
/// shuts down the client write side and releases its end of the link.
async fn pump_downstream<R, W>(
    mut backend: R,
    mut client: W,
    deadline: Instant,
    mut link: Teardown,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0;
    let result = tokio::select! {
        result = copy_until_deadline(&mut backend, &mut client, deadline, &mut bytes) => result,
        _ = &mut link.peer_done => {
            debug!(direction = %Direction::Downstream, "Stopped by upstream close");
            Ok(())
        }
    };
    let _ = with_deadline(deadline, client.shutdown()).await;
    drop(link);
    PumpOutcome { bytes, result }
}

async fn copy_until_deadline<R, W>(
    src: &mut R,
    dst: &mut W,
    deadline: Instant,
    bytes: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STEADY_READ_BUFFER_SIZE];
    loop {
        let n = with_deadline(deadline, src.read(&mut buf)).await?;
        if n == 0 {
            return Ok(());
        }
        with_deadline(deadline, dst.write_all(&buf[..n])).await?;
        *bytes += n as u64;
    }
}

/// Run `fut`, failing with `DeadlineElapsed` once `deadline` passes.
async fn with_deadline<F, T, E>(deadline: Instant, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<RelayError>,
{
    match timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(RelayError::DeadlineElapsed),
    }
}

fn log_outcome(direction: Direction, outcome: &PumpOutcome) {
    match &outcome.result {
        Ok(()) => debug!(direction = %direction, bytes = outcome.bytes, "End of stream"),
        Err(e) => warn!(
            direction = %direction,
            reason = e.reason_code(),
            bytes = outcome.bytes,
            error = %e,
            "Relay error"
        ),
    }
}
