//! Relay configuration.
//!
//! Settings are layered, lowest precedence first:
//! 1. profile defaults (`--profile`)
//! 2. the INI file given with `--config`
//! 3. environment variables and flags (both handled by clap)
//!
//! Every layer is forgiving: a value that fails to parse is logged and the
//! value from the layer below is kept. Flags and environment variables reach
//! this module as raw strings and go through the same parsers as file keys.
//! Backend entries are the exception: the pool has a default in every profile,
//! but an entry that is given and does not parse is fatal.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{debug, warn};

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::relay::{
    non_zero, BackendAddr, BackendSelector, FragmentConfig, ListenerConfig, SessionConfig,
    DEFAULT_ACCEPT_DELAY, DEFAULT_FIRST_READ_DELAY, DEFAULT_FRAGMENT_DELAY, DEFAULT_FRAGMENT_SIZE,
    DEFAULT_LISTEN_PORT, DEFAULT_SOCKET_TIMEOUT,
};

/// Named default sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Profile {
    /// TLS fronting: port 2500 to 104.21.12.42:443, 77-byte chunks, 200 ms apart.
    #[default]
    Tls,
    /// Plain TCP: port 8080 to 1.1.1.1:80, 1 KiB chunks, 10 ms apart.
    Plain,
}

impl Profile {
    fn settings(self) -> Settings {
        let base = Settings {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: DEFAULT_LISTEN_PORT,
            backends: vec![String::from("104.21.12.42")],
            backend_port: 443,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            fragment_delay: DEFAULT_FRAGMENT_DELAY,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            first_read_delay: DEFAULT_FIRST_READ_DELAY,
            accept_delay: DEFAULT_ACCEPT_DELAY,
        };

        match self {
            Profile::Tls => base,
            Profile::Plain => Settings {
                listen_port: 8080,
                backends: vec![String::from("1.1.1.1")],
                backend_port: 80,
                fragment_size: non_zero(1024),
                fragment_delay: Duration::from_millis(10),
                socket_timeout: Duration::from_secs(10),
                ..base
            },
        }
    }
}

/// Unresolved settings; backends are still raw entries.
#[derive(Debug, Clone)]
struct Settings {
    listen_host: IpAddr,
    listen_port: u16,
    backends: Vec<String>,
    backend_port: u16,
    fragment_size: NonZeroUsize,
    fragment_delay: Duration,
    socket_timeout: Duration,
    first_read_delay: Duration,
    accept_delay: Duration,
}

impl Settings {
    /// Overlay values from an INI file.
    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let file = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .map_err(|source| ConfigError::File {
                path: path.display().to_string(),
                source,
            })?;

        debug!(path = %path.display(), "Loading config file");

        self.apply_each(|key| lookup(&file, key));

        let backends =
            lookup(&file, "backend_addresses").or_else(|| lookup(&file, "backend_address"));
        apply("backend_addresses", backends.as_deref(), &mut self.backends, parse_backends);

        Ok(())
    }

    /// Overlay values given on the command line or through the environment.
    fn apply_cli(&mut self, cli: &Cli) {
        self.apply_each(|key| {
            let raw = match key {
                "listen_host" => &cli.listen_host,
                "listen_port" => &cli.listen_port,
                "backend_port" => &cli.backend_port,
                "fragment_size" => &cli.fragment_size,
                "fragment_delay_ms" => &cli.fragment_delay_ms,
                "socket_timeout_ms" => &cli.socket_timeout_ms,
                "first_read_delay_ms" => &cli.first_read_delay_ms,
                "accept_delay_ms" => &cli.accept_delay_ms,
                _ => return None,
            };
            raw.clone()
        });

        let backends = cli.backends.join(",");
        let backends = (!cli.backends.is_empty()).then_some(backends);
        apply("backend_addresses", backends.as_deref(), &mut self.backends, parse_backends);
    }

    /// Overlay every scalar key, reading raw values through `value`.
    fn apply_each(&mut self, value: impl Fn(&str) -> Option<String>) {
        apply("listen_host", value("listen_host").as_deref(), &mut self.listen_host, parse_host);
        apply("listen_port", value("listen_port").as_deref(), &mut self.listen_port, parse_port);
        apply(
            "backend_port",
            value("backend_port").as_deref(),
            &mut self.backend_port,
            parse_backend_port,
        );
        apply(
            "fragment_size",
            value("fragment_size").as_deref(),
            &mut self.fragment_size,
            parse_size,
        );
        apply(
            "fragment_delay_ms",
            value("fragment_delay_ms").as_deref(),
            &mut self.fragment_delay,
            parse_millis,
        );
        apply(
            "socket_timeout_ms",
            value("socket_timeout_ms").as_deref(),
            &mut self.socket_timeout,
            parse_timeout,
        );
        apply(
            "first_read_delay_ms",
            value("first_read_delay_ms").as_deref(),
            &mut self.first_read_delay,
            parse_millis,
        );
        apply(
            "accept_delay_ms",
            value("accept_delay_ms").as_deref(),
            &mut self.accept_delay,
            parse_millis,
        );
    }

    fn resolve(self) -> Result<Config, ConfigError> {
        let backends = self
            .backends
            .iter()
            .map(|entry| BackendAddr::parse(entry, self.backend_port))
            .collect::<Result<Vec<_>, _>>()?;
        if backends.is_empty() {
            return Err(ConfigError::EmptyBackendPool);
        }

        Ok(Config {
            listen_addr: SocketAddr::new(self.listen_host, self.listen_port),
            backends,
            backend_port: self.backend_port,
            fragment: FragmentConfig::new(self.fragment_size, self.fragment_delay),
            socket_timeout: self.socket_timeout,
            first_read_delay: self.first_read_delay,
            accept_delay: self.accept_delay,
        })
    }
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Backends in configured order. Never empty.
    pub backends: Vec<BackendAddr>,

    /// Port applied to backend entries that had none.
    pub backend_port: u16,

    /// How the first client segment is split.
    pub fragment: FragmentConfig,

    /// Session lifetime from accept, also the dial timeout.
    pub socket_timeout: Duration,

    /// Pause before the first client read.
    pub first_read_delay: Duration,

    /// Pause after each accepted connection.
    pub accept_delay: Duration,
}

impl Config {
    /// Resolve the configuration from parsed command-line arguments.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut settings = cli.profile.settings();
        if let Some(path) = &cli.config {
            settings.apply_file(path)?;
        }
        settings.apply_cli(cli);
        settings.resolve()
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen_addr,
            accept_delay: self.accept_delay,
            session: SessionConfig {
                socket_timeout: self.socket_timeout,
                first_read_delay: self.first_read_delay,
                fragment: self.fragment,
            },
        }
    }

    /// Backend selector for the configured pool.
    pub fn selector(&self) -> Result<BackendSelector, ConfigError> {
        BackendSelector::from_addrs(self.backends.clone())
    }
}

fn lookup(file: &config::Config, key: &str) -> Option<String> {
    match file.get_string(key) {
        Ok(value) => Some(value),
        Err(config::ConfigError::NotFound(_)) => None,
        Err(e) => {
            warn!(key, error = %e, "Ignoring unreadable config value");
            None
        }
    }
}

/// Replace `current` with the parsed value, keeping it when the value is
/// absent or does not parse.
fn apply<T>(key: &str, raw: Option<&str>, current: &mut T, parse: fn(&str) -> Option<T>) {
    let Some(raw) = raw else {
        return;
    };
    match parse(raw.trim()) {
        Some(value) => *current = value,
        None => warn!(key, value = %raw, "Invalid config value, keeping default"),
    }
}

/// Listen host: IP literals only.
fn parse_host(s: &str) -> Option<IpAddr> {
    s.parse().ok()
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse().ok()
}

fn parse_backend_port(s: &str) -> Option<u16> {
    s.parse().ok().filter(|&port| port != 0)
}

fn parse_size(s: &str) -> Option<NonZeroUsize> {
    s.parse().ok()
}

fn parse_millis(s: &str) -> Option<Duration> {
    s.parse().ok().map(Duration::from_millis)
}

fn parse_timeout(s: &str) -> Option<Duration> {
    parse_millis(s).filter(|d| !d.is_zero())
}

fn parse_backends(s: &str) -> Option<Vec<String>> {
    let entries: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect();
    (!entries.is_empty()).then_some(entries)
}
