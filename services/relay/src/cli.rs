//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Profile;
use crate::logging::LogFormat;

/// tlsfrag - TCP relay that fragments the first client segment.
///
/// Listens for TCP connections and relays each one to a backend, splitting
/// the first segment (normally a TLS ClientHello) into small delayed chunks.
///
/// Settings are layered: profile defaults, then the config file, then
/// environment variables and flags. A value that does not parse is logged
/// and the layer below wins.
#[derive(Debug, Parser)]
#[command(name = "tlsfrag")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// INI config file.
    #[arg(long, short = 'c', env = "TLSFRAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Default set of timings and ports.
    #[arg(long, value_enum, default_value = "tls", env = "TLSFRAG_PROFILE")]
    pub profile: Profile,

    /// Address to listen on (IP literal).
    #[arg(long, env = "TLSFRAG_LISTEN_HOST")]
    pub listen_host: Option<String>,

    /// Port to listen on.
    #[arg(long, short = 'p', env = "TLSFRAG_LISTEN_PORT")]
    pub listen_port: Option<String>,

    /// Backend address; repeat or comma-separate for round-robin.
    #[arg(long = "backend", short = 'b', env = "TLSFRAG_BACKENDS", value_delimiter = ',')]
    pub backends: Vec<String>,

    /// Port used for backends given without one.
    #[arg(long, env = "TLSFRAG_BACKEND_PORT")]
    pub backend_port: Option<String>,

    /// Bytes per chunk of the first segment.
    #[arg(long, env = "TLSFRAG_FRAGMENT_SIZE")]
    pub fragment_size: Option<String>,

    /// Pause after each chunk, in milliseconds.
    #[arg(long, env = "TLSFRAG_FRAGMENT_DELAY_MS")]
    pub fragment_delay_ms: Option<String>,

    /// Session lifetime and dial timeout, in milliseconds.
    #[arg(long, env = "TLSFRAG_SOCKET_TIMEOUT_MS")]
    pub socket_timeout_ms: Option<String>,

    /// Pause before the first client read, in milliseconds.
    #[arg(long, env = "TLSFRAG_FIRST_READ_DELAY_MS")]
    pub first_read_delay_ms: Option<String>,

    /// Pause after each accepted connection, in milliseconds.
    #[arg(long, env = "TLSFRAG_ACCEPT_DELAY_MS")]
    pub accept_delay_ms: Option<String>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info", env = "TLSFRAG_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "TLSFRAG_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_backends_repeat_and_split() {
        let cli = Cli::try_parse_from([
            "tlsfrag",
            "--backend",
            "10.0.0.1",
            "-b",
            "10.0.0.2:8443,10.0.0.3",
        ])
        .unwrap();
        assert_eq!(cli.backends, ["10.0.0.1", "10.0.0.2:8443", "10.0.0.3"]);
        assert_eq!(cli.profile, Profile::Tls);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_numeric_values_pass_through_raw() {
        let cli = Cli::try_parse_from([
            "tlsfrag",
            "--fragment-size",
            "0",
            "--socket-timeout-ms",
            "0",
            "--listen-host",
            "localhost",
        ])
        .unwrap();
        assert_eq!(cli.fragment_size.as_deref(), Some("0"));
        assert_eq!(cli.socket_timeout_ms.as_deref(), Some("0"));
        assert_eq!(cli.listen_host.as_deref(), Some("localhost"));
    }

    #[test]
    fn test_rejects_unknown_profile() {
        assert!(Cli::try_parse_from(["tlsfrag", "--profile", "quic"]).is_err());
    }
}
