//! tlsfrag relay library.
//!
//! A local TCP relay that splits the first segment of every client connection
//! into small, delayed chunks before forwarding it to a backend, then relays
//! the rest of the stream unmodified in both directions.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;

pub use config::{Config, Profile};
pub use error::{ConfigError, RelayError};
pub use relay::{
    BackendAddr, BackendSelector, FragmentConfig, Listener, ListenerConfig, ListenerStats,
    SessionConfig,
};
