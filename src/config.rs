//! Resolver configuration and its loaders.
//!
//! A [`Config`] is the already-resolved form: which nameservers to ask, how
//! long to wait, how often to retry, and the local hosts table.  Loaders
//! produce it: [`UnixConfigLoader`] reads `/etc/resolv.conf` and
//! `/etc/hosts` the way glibc's resolver does, [`StaticConfigLoader`] hands
//! out a fixed configuration for embedders and tests.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::read_to_string;

use crate::hosts::KnownHosts;

/// Default port for plain DNS.
pub const DNS_PORT: u16 = 53;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_ATTEMPTS: usize = 2;

/// Resolved runtime configuration for a stub resolver.
///
/// The invariants (at least one nameserver, at least one attempt) are
/// enforced at construction, so a `Config` in hand is always usable.
#[derive(Debug, Clone)]
pub struct Config {
    nameservers: Vec<SocketAddr>,
    timeout: Duration,
    attempts: usize,
    known_hosts: KnownHosts,
    search: Vec<String>,
    ndots: usize,
}

impl Config {
    /// Create a configuration for the given nameservers, with the default
    /// timeout and attempt budget and an empty hosts table.
    pub fn new(nameservers: Vec<SocketAddr>) -> Result<Self, ConfigError> {
        if nameservers.is_empty() {
            return Err(ConfigError::NoNameservers);
        }

        Ok(Config {
            nameservers,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            known_hosts: KnownHosts::new(),
            search: Vec::new(),
            ndots: 1,
        })
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the total attempts across the nameserver rotation.  Values below
    /// 1 are treated as 1.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Replace the hosts table.
    pub fn with_known_hosts(mut self, known_hosts: KnownHosts) -> Self {
        self.known_hosts = known_hosts;
        self
    }

    /// The nameservers to ask, in rotation order.  Never empty.
    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.nameservers
    }

    /// How long to wait for each individual request.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Total tries across the nameserver rotation.  Never zero.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// The local hosts table, consulted before any nameserver.
    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// The search list, as configured.  Parsed and exposed for callers that
    /// implement suffix searching; the resolver itself sends names as
    /// given.
    pub fn search(&self) -> &[String] {
        &self.search
    }

    /// The `ndots` threshold accompanying the search list.
    pub fn ndots(&self) -> usize {
        self.ndots
    }
}

/// An error that can occur loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration has no nameservers to query.
    NoNameservers,
    /// Reading a configuration file failed.
    Io { path: PathBuf, error: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoNameservers => write!(f, "no nameservers specified"),
            ConfigError::Io { path, error } => {
                write!(f, "could not read '{}': {error}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::NoNameservers => None,
            ConfigError::Io { error, .. } => Some(error),
        }
    }
}

/// Produces the resolver configuration.
///
/// The resolver loads configuration lazily, once, on the first lookup;
/// concurrent first lookups share the same load.  A failed load is retried
/// by the next lookup.
#[async_trait]
pub trait ConfigLoader: Send + Sync + fmt::Debug {
    async fn load(&self) -> Result<Config, ConfigError>;
}

/// Loads configuration the way Unix resolvers do: nameservers and options
/// from `/etc/resolv.conf`, the hosts table from `/etc/hosts`.
///
/// A missing resolv.conf falls back to a nameserver on localhost, matching
/// glibc.  A missing or unreadable hosts file just leaves the hosts table
/// empty.
#[derive(Debug, Clone)]
pub struct UnixConfigLoader {
    resolv_conf: PathBuf,
    hosts_file: PathBuf,
}

impl UnixConfigLoader {
    pub fn new() -> Self {
        Self::with_paths("/etc/resolv.conf", "/etc/hosts")
    }

    pub fn with_paths(resolv_conf: impl Into<PathBuf>, hosts_file: impl Into<PathBuf>) -> Self {
        UnixConfigLoader {
            resolv_conf: resolv_conf.into(),
            hosts_file: hosts_file.into(),
        }
    }
}

impl Default for UnixConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigLoader for UnixConfigLoader {
    async fn load(&self) -> Result<Config, ConfigError> {
        let mut config = match read_to_string(&self.resolv_conf).await {
            Ok(data) => parse_resolv_conf(&data),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %self.resolv_conf.display(),
                    "no resolv.conf, using localhost nameserver"
                );
                parse_resolv_conf("")
            }
            Err(error) => {
                return Err(ConfigError::Io {
                    path: self.resolv_conf.clone(),
                    error,
                })
            }
        };

        match KnownHosts::from_file(&self.hosts_file).await {
            Ok(known_hosts) => config.known_hosts = known_hosts,
            Err(error) => {
                tracing::warn!(
                    path = %self.hosts_file.display(),
                    %error,
                    "could not read hosts file"
                );
            }
        }

        Ok(config)
    }
}

/// Hands out a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    pub fn new(config: Config) -> Self {
        StaticConfigLoader { config }
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Parse resolv.conf data.  Unknown keywords and malformed values are
/// ignored, like glibc ignores them; missing pieces fall back to defaults
/// (a localhost nameserver, 3 second timeout, 2 attempts).
fn parse_resolv_conf(data: &str) -> Config {
    let mut nameservers = Vec::new();
    let mut search = Vec::new();
    let mut ndots = 1;
    let mut timeout = DEFAULT_TIMEOUT;
    let mut attempts = DEFAULT_ATTEMPTS;

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("nameserver") => {
                if let Some(word) = words.next() {
                    if let Ok(address) = word.parse::<IpAddr>() {
                        nameservers.push(SocketAddr::new(address, DNS_PORT));
                    } else if let Ok(address) = word.parse::<SocketAddr>() {
                        nameservers.push(address);
                    }
                }
            }
            Some("domain") => {
                if let Some(word) = words.next() {
                    search = vec![word.to_string()];
                }
            }
            Some("search") => {
                search = words.map(str::to_string).collect();
            }
            Some("options") => {
                for word in words {
                    match word.split_once(':') {
                        Some(("ndots", value)) => {
                            if let Ok(value) = value.parse() {
                                ndots = value;
                            }
                        }
                        Some(("timeout", value)) => {
                            if let Ok(value) = value.parse::<u64>() {
                                timeout = Duration::from_secs(value);
                            }
                        }
                        Some(("attempts", value)) => {
                            if let Ok(value) = value.parse::<usize>() {
                                if value > 0 {
                                    attempts = value;
                                }
                            }
                        }
                        _ => (),
                    }
                }
            }
            _ => (),
        }
    }

    if nameservers.is_empty() {
        nameservers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT));
    }

    Config {
        nameservers,
        timeout,
        attempts,
        known_hosts: KnownHosts::new(),
        search,
        ndots,
    }
}
