use std::fmt;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

use crate::config::ConfigError;
use crate::net::TransportError;

/// A single answer record.
///
/// `data` is the presentation form appropriate to the record type: a dotted
/// quad for A, colon-hex for AAAA, the target name for PTR and CNAME, the
/// codec's presentation form for everything else.
///
/// `ttl` is absent for records which never came from a nameserver (IP
/// literals and hosts-table entries) and for records reconstituted from the
/// cache, which does not store the remaining lifetime.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub data: String,
    pub rtype: RecordType,
    pub ttl: Option<u32>,
}

impl Record {
    pub fn new(data: String, rtype: RecordType, ttl: Option<u32>) -> Self {
        Record { data, rtype, ttl }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.ttl {
            Some(ttl) => write!(f, "{} {} (ttl {ttl})", self.rtype, self.data),
            None => write!(f, "{} {}", self.rtype, self.data),
        }
    }
}

/// An error that can occur when resolving a name.
#[derive(Debug)]
pub enum ResolutionError {
    /// A `resolve` restriction other than A or AAAA: a caller bug, reported
    /// before any I/O happens.
    InvalidRestriction { rtype: RecordType },
    /// The name is not a valid DNS name.
    InvalidName { name: String },
    /// The name is an IP literal of the wrong family for the restriction.
    LiteralFamilyMismatch {
        name: String,
        restriction: RecordType,
    },
    /// Loading the resolver configuration failed.
    Config(ConfigError),
    /// The name has no records of the queried type.  `cached` distinguishes
    /// a remembered empty answer set from a fresh one.
    NoRecords {
        name: String,
        rtype: RecordType,
        cached: bool,
    },
    /// The nameserver answered with a non-zero response code.
    ErrorResponse { rcode: ResponseCode },
    /// The reply was not a response message at all.
    NotAResponse,
    /// The nameserver truncated its response even over TCP.
    Truncated,
    /// No nameserver produced a usable response within the attempt budget.
    NoResponse {
        attempts: usize,
        cause: Option<TransportError>,
    },
    /// Both halves of an unrestricted address lookup failed.
    AllFailed {
        a: Box<ResolutionError>,
        aaaa: Box<ResolutionError>,
    },
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolutionError::InvalidRestriction { rtype } => {
                write!(f, "record type restriction must be A or AAAA, got {rtype}")
            }
            ResolutionError::InvalidName { name } => {
                write!(f, "'{name}' is not a valid DNS name")
            }
            ResolutionError::LiteralFamilyMismatch { name, restriction } => {
                write!(
                    f,
                    "'{name}' is an IP literal of the wrong family for a {restriction} lookup"
                )
            }
            ResolutionError::Config(error) => {
                write!(f, "could not load resolver configuration: {error}")
            }
            ResolutionError::NoRecords {
                name,
                rtype,
                cached: true,
            } => {
                write!(f, "no {rtype} records for '{name}' (cached result)")
            }
            ResolutionError::NoRecords {
                name,
                rtype,
                cached: false,
            } => {
                write!(f, "no {rtype} records returned for '{name}'")
            }
            ResolutionError::ErrorResponse { rcode } => {
                write!(f, "server returned error response code {}", u16::from(*rcode))
            }
            ResolutionError::NotAResponse => {
                write!(f, "server sent a message which is not a response")
            }
            ResolutionError::Truncated => write!(f, "server returned truncated response"),
            ResolutionError::NoResponse { attempts, .. } => {
                write!(f, "no response from any nameserver after {attempts} attempts")
            }
            ResolutionError::AllFailed { .. } => write!(f, "all query attempts failed"),
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolutionError::Config(error) => Some(error),
            ResolutionError::NoResponse {
                cause: Some(cause), ..
            } => Some(cause),
            ResolutionError::AllFailed { a, .. } => Some(a.as_ref()),
            _ => None,
        }
    }
}
