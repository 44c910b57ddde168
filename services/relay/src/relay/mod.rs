//! TCP relay with first-segment fragmentation.
//!
//! This module provides:
//! - The listener and its accept loop
//! - Backend selection (static or round-robin)
//! - The per-connection session state machine
//! - The fragmenting writer used for the first client segment
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> BackendSelector -> Backend
//!                          |
//!              first read: fragmented write
//!              later reads: plain copy
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tlsfrag_relay::relay::{BackendAddr, BackendSelector, Listener, ListenerConfig};
//!
//! let selector = Arc::new(BackendSelector::from_addrs(vec![
//!     BackendAddr::new("104.21.12.42", 443),
//! ])?);
//! let config = ListenerConfig::new("127.0.0.1:2500".parse()?);
//! let listener = Arc::new(Listener::bind(config, selector).await?);
//! listener.run().await?;
//! ```

mod fragment;
mod listener;
mod selector;
mod session;

pub(crate) use fragment::non_zero;
pub use fragment::{
    fragment_count, fragments, send_fragmented, FragmentConfig, FragmentReport,
    DEFAULT_FRAGMENT_DELAY, DEFAULT_FRAGMENT_SIZE,
};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_ACCEPT_DELAY, DEFAULT_LISTEN_PORT,
};
pub use selector::{BackendAddr, BackendSelector, RotatingPool};
pub use session::{
    Direction, Session, SessionConfig, SessionState, SessionSummary, DEFAULT_FIRST_READ_DELAY,
    DEFAULT_SOCKET_TIMEOUT, FIRST_READ_BUFFER_SIZE, STEADY_READ_BUFFER_SIZE,
};
