//! Error types for the relay.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::relay::BackendAddr;

/// Per-session relay errors.
///
/// None of these cross a session boundary: the session that produced one is
/// torn down and the accept loop keeps running.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Backend refused or failed the connection attempt.
    #[error("dial {backend} failed: {source}")]
    Dial {
        backend: BackendAddr,
        #[source]
        source: io::Error,
    },

    /// Backend did not answer within the dial timeout.
    #[error("dial {backend} timed out after {timeout:?}")]
    DialTimeout { backend: BackendAddr, timeout: Duration },

    /// The session deadline passed while a read or write was pending.
    #[error("session deadline elapsed")]
    DeadlineElapsed,

    /// A chunk of the first segment could not be written.
    #[error("fragmented write aborted after {sent} of {total} chunks: {source}")]
    Fragment {
        sent: usize,
        total: usize,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on an established socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Short reason code used in log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Dial { .. } => "dial_failed",
            RelayError::DialTimeout { .. } => "dial_timeout",
            RelayError::DeadlineElapsed => "deadline_elapsed",
            RelayError::Fragment { .. } => "fragment_aborted",
            RelayError::Io(_) => "io_error",
        }
    }
}

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No backend address was configured.
    #[error("backend pool is empty: set --backend, TLSFRAG_BACKENDS or backend_addresses")]
    EmptyBackendPool,

    /// A backend entry could not be parsed.
    #[error("invalid backend address {entry:?}: {reason}")]
    InvalidBackend { entry: String, reason: String },

    /// The config file could not be read or parsed.
    #[error("failed to load config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: config::ConfigError,
    },
}
