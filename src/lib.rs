//! An asynchronous DNS stub resolver.
//!
//! Questions are forwarded to the recursive nameservers from the system
//! configuration (or one you build yourself), over UDP with a retry over TCP
//! when a response comes back truncated.  Answer sets are cached per record
//! type, the local hosts table is honoured, and IP literals are answered
//! without any network traffic at all.
//!
//! ```no_run
//! use dns_stub::StubResolver;
//!
//! # async fn example() -> Result<(), dns_stub::ResolutionError> {
//! let resolver = StubResolver::new();
//! for record in resolver.resolve("example.com", None).await? {
//!     println!("{record}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]

pub mod cache;
pub mod config;
pub mod hosts;
pub mod name;
pub mod net;
pub mod resolver;
pub mod types;

pub use hickory_proto::rr::RecordType;

pub use self::cache::{Cache, CacheError, SharedCache};
pub use self::config::{
    Config, ConfigError, ConfigLoader, StaticConfigLoader, UnixConfigLoader,
};
pub use self::hosts::KnownHosts;
pub use self::resolver::StubResolver;
pub use self::types::{Record, ResolutionError};
