//! The local hosts table.
//!
//! Entries come from a hosts file, for example `/etc/hosts`, and take
//! precedence over nameserver queries: a name with a hosts entry is never
//! sent upstream.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tokio::fs::read_to_string;

use hickory_proto::rr::RecordType;

use crate::name;
use crate::types::Record;

/// Host-to-address entries, split by address family.
///
/// Names are stored in normalised form (see [`crate::name::normalise`]), so
/// lookups are case-insensitive.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct KnownHosts {
    pub v4: HashMap<String, Ipv4Addr>,
    pub v6: HashMap<String, Ipv6Addr>,
}

impl KnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another table into this one.  If the same name has entries in
    /// both tables, the other table wins.
    pub fn merge(&mut self, other: KnownHosts) {
        self.v4.extend(other.v4);
        self.v6.extend(other.v6);
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Look up a normalised name.  An unrestricted lookup returns the A
    /// entry before the AAAA entry; a restricted lookup returns only that
    /// family.  Hosts entries carry no TTL.
    pub fn lookup(&self, name: &str, restriction: Option<RecordType>) -> Vec<Record> {
        let mut records = Vec::new();

        if restriction.is_none() || restriction == Some(RecordType::A) {
            if let Some(address) = self.v4.get(name) {
                records.push(Record::new(address.to_string(), RecordType::A, None));
            }
        }
        if restriction.is_none() || restriction == Some(RecordType::AAAA) {
            if let Some(address) = self.v6.get(name) {
                records.push(Record::new(address.to_string(), RecordType::AAAA, None));
            }
        }

        records
    }

    /// Read a hosts file, for example /etc/hosts.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, HostsError> {
        match read_to_string(path).await {
            Ok(data) => Ok(Self::deserialise(&data)),
            Err(error) => Err(HostsError::Io { error }),
        }
    }

    /// Parse a string of hosts data.
    ///
    /// Lines that do not parse as an address followed by one or more names
    /// are skipped rather than treated as errors: real hosts files
    /// accumulate junk, and the resolver should still come up.
    pub fn deserialise(data: &str) -> Self {
        let mut hosts = Self::new();

        for line in data.lines() {
            let line = match line.split_once('#') {
                Some((before_comment, _)) => before_comment,
                None => line,
            };

            let mut words = line.split_whitespace();
            let address = match words.next() {
                Some(word) => word,
                None => continue,
            };
            let address: IpAddr = match address.parse() {
                Ok(address) => address,
                Err(_) => continue,
            };

            for word in words {
                if let Ok(name) = name::normalise(word) {
                    match address {
                        IpAddr::V4(address) => {
                            hosts.v4.insert(name, address);
                        }
                        IpAddr::V6(address) => {
                            hosts.v6.insert(name, address);
                        }
                    }
                }
            }
        }

        hosts
    }
}

/// An error that can occur reading a hosts file.
#[derive(Debug)]
pub enum HostsError {
    Io { error: io::Error },
}

impl fmt::Display for HostsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostsError::Io { error } => write!(f, "could not read hosts file: {error}"),
        }
    }
}

impl std::error::Error for HostsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostsError::Io { error } => Some(error),
        }
    }
}
