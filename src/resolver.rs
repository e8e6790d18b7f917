//! The stub resolver: input classification, the per-question query engine,
//! and answer caching.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::cache::{Cache, SharedCache};
use crate::config::{Config, ConfigLoader, StaticConfigLoader, UnixConfigLoader};
use crate::name;
use crate::net::{Protocol, ServerRegistry};
use crate::types::{Record, ResolutionError};

/// Prefix of every cache key.  Bit-compatible with amphp/dns caches, so
/// inspection tooling built for those keeps working.
const CACHE_KEY_PREFIX: &str = "amphp.dns.";

/// Longest a negative entry (a name known to have no records of a type) may
/// live, per RFC 2308 §7.1.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(300);

/// A DNS stub resolver.
///
/// Questions go to the configured recursive nameservers over UDP, retrying
/// over TCP when a response comes back truncated.  Answer sets are cached
/// per record type, the hosts table takes precedence over the network, and
/// IP literals are answered inline.
///
/// Cloning is cheap: clones share the configuration, the cache, and the
/// open server connections.
#[derive(Debug, Clone)]
pub struct StubResolver {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    loader: Box<dyn ConfigLoader>,
    config: OnceCell<Config>,
    cache: Box<dyn Cache>,
    servers: ServerRegistry,
}

impl StubResolver {
    /// A resolver using the system configuration and an in-memory cache.
    pub fn new() -> Self {
        Self::with_parts(UnixConfigLoader::new(), SharedCache::new())
    }

    /// A resolver with a fixed configuration and an in-memory cache.
    pub fn with_config(config: Config) -> Self {
        Self::with_parts(StaticConfigLoader::new(config), SharedCache::new())
    }

    /// A resolver from its parts: any configuration source and any cache
    /// backend.
    pub fn with_parts(
        loader: impl ConfigLoader + 'static,
        cache: impl Cache + 'static,
    ) -> Self {
        StubResolver {
            inner: Arc::new(Inner {
                loader: Box::new(loader),
                config: OnceCell::new(),
                cache: Box::new(cache),
                servers: ServerRegistry::new(),
            }),
        }
    }

    /// The configuration, loading it on first use.  Concurrent first
    /// callers share one load; a failed load is retried by the next caller.
    async fn config(&self) -> Result<&Config, ResolutionError> {
        self.inner
            .config
            .get_or_try_init(|| self.inner.loader.load())
            .await
            .map_err(ResolutionError::Config)
    }

    /// Resolve a host name into address records.
    ///
    /// With no restriction this looks up A and AAAA records concurrently
    /// and returns whatever succeeds, A records first; it only fails when
    /// both lookups fail.  With a restriction of `A` or `AAAA` only that
    /// family is looked up; any other restriction is rejected.
    ///
    /// IP literals and hosts-table entries are answered without asking any
    /// nameserver, and carry no TTL.
    pub async fn resolve(
        &self,
        name: &str,
        restriction: Option<RecordType>,
    ) -> Result<Vec<Record>, ResolutionError> {
        if let Some(rtype) = restriction {
            if rtype != RecordType::A && rtype != RecordType::AAAA {
                return Err(ResolutionError::InvalidRestriction { rtype });
            }
        }

        let config = self.config().await?;

        if let Ok(address) = name.parse::<IpAddr>() {
            return literal_records(name, address, restriction);
        }

        let normalised = name::normalise(name)?;

        let from_hosts = config.known_hosts().lookup(&normalised, restriction);
        if !from_hosts.is_empty() {
            tracing::debug!(name = %normalised, "answered from hosts table");
            return Ok(from_hosts);
        }

        if let Some(rtype) = restriction {
            return self.query(&normalised, rtype).await;
        }

        let (a, aaaa) = tokio::join!(
            self.query(&normalised, RecordType::A),
            self.query(&normalised, RecordType::AAAA),
        );

        match (a, aaaa) {
            (Err(a), Err(aaaa)) => Err(ResolutionError::AllFailed {
                a: Box::new(a),
                aaaa: Box::new(aaaa),
            }),
            (a, aaaa) => {
                let mut records = a.unwrap_or_default();
                records.extend(aaaa.unwrap_or_default());
                Ok(records)
            }
        }
    }

    /// Look up records of one type for a name, consulting the cache first
    /// and asking the configured nameservers on a miss.
    ///
    /// PTR queries for IP literals are rewritten to the reverse-lookup
    /// form; A and AAAA queries get their name normalised; any other name
    /// is sent as given.
    pub async fn query(
        &self,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>, ResolutionError> {
        let config = self.config().await?;
        let name = question_name(name, rtype)?;

        self.run_query(config, &name, rtype)
            .instrument(tracing::error_span!("query", name = %name, %rtype))
            .await
    }

    async fn run_query(
        &self,
        config: &Config,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>, ResolutionError> {
        let question = build_question(name, rtype)?;

        let key = cache_key(name, rtype);
        if let Some(records) = self.cached(&key, name, rtype).await? {
            tracing::debug!("cache hit");
            return Ok(records);
        }

        let nameservers = config.nameservers();
        let mut protocol = Protocol::Udp;
        let mut last_error = None;
        let mut attempt = 0;

        while attempt < config.attempts() {
            let address = nameservers[attempt % nameservers.len()];

            let server = match self
                .inner
                .servers
                .get(protocol, address, config.timeout())
                .await
            {
                Ok(server) => server,
                Err(error) => {
                    tracing::debug!(%protocol, %address, %error, "could not connect");
                    last_error = Some(error);
                    attempt += 1;
                    continue;
                }
            };

            let response = match server.ask(question.clone(), config.timeout()).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(%protocol, %address, %error, "attempt failed");
                    last_error = Some(error);
                    attempt += 1;
                    continue;
                }
            };

            if response.message_type() != MessageType::Response {
                return Err(ResolutionError::NotAResponse);
            }
            if response.response_code() != ResponseCode::NoError {
                return Err(ResolutionError::ErrorResponse {
                    rcode: response.response_code(),
                });
            }
            if response.truncated() {
                if protocol == Protocol::Udp {
                    // Retry against the same nameserver over TCP; the
                    // truncated reply does not consume an attempt.
                    tracing::debug!(%address, "truncated response, retrying over tcp");
                    protocol = Protocol::Tcp;
                    continue;
                }
                return Err(ResolutionError::Truncated);
            }

            return self.cache_answers(name, rtype, &response).await;
        }

        Err(ResolutionError::NoResponse {
            attempts: config.attempts(),
            cause: last_error,
        })
    }

    /// Cache lookup.  `Ok(Some(records))` on a positive hit; a remembered
    /// empty answer set fails the query; backend and decode problems count
    /// as misses.
    async fn cached(
        &self,
        key: &str,
        name: &str,
        rtype: RecordType,
    ) -> Result<Option<Vec<Record>>, ResolutionError> {
        let bytes = match self.inner.cache.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(error) => {
                tracing::warn!(%key, %error, "cache read failed");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(payloads) if payloads.is_empty() => Err(ResolutionError::NoRecords {
                name: name.to_string(),
                rtype,
                cached: true,
            }),
            Ok(payloads) => Ok(Some(
                payloads
                    .into_iter()
                    .map(|data| Record::new(data, rtype, None))
                    .collect(),
            )),
            Err(error) => {
                tracing::warn!(%key, %error, "cache entry is not a valid answer list");
                Ok(None)
            }
        }
    }

    /// Group the response's answers by record type, cache each group under
    /// its minimum TTL, and build the records of the queried type.  A
    /// response without the queried type stores a negative entry and fails.
    async fn cache_answers(
        &self,
        name: &str,
        rtype: RecordType,
        response: &Message,
    ) -> Result<Vec<Record>, ResolutionError> {
        let mut grouped: HashMap<RecordType, (Vec<String>, u32)> = HashMap::new();
        for answer in response.answers() {
            let data = match answer.data() {
                Some(rdata) => record_data(rdata),
                None => continue,
            };
            let (payloads, min_ttl) = grouped
                .entry(answer.record_type())
                .or_insert_with(|| (Vec::new(), u32::MAX));
            payloads.push(data);
            *min_ttl = (*min_ttl).min(answer.ttl());
        }

        for (answer_type, (payloads, min_ttl)) in &grouped {
            self.cache_set(
                &cache_key(name, *answer_type),
                payloads,
                Duration::from_secs(u64::from(*min_ttl)),
            )
            .await;
        }

        match grouped.remove(&rtype) {
            Some((payloads, min_ttl)) => Ok(payloads
                .into_iter()
                .map(|data| Record::new(data, rtype, Some(min_ttl)))
                .collect()),
            None => {
                self.cache_set(&cache_key(name, rtype), &[], NEGATIVE_CACHE_TTL)
                    .await;
                Err(ResolutionError::NoRecords {
                    name: name.to_string(),
                    rtype,
                    cached: false,
                })
            }
        }
    }

    /// Cache writes are best-effort: a failing backend costs upstream
    /// queries, not correctness.
    async fn cache_set(&self, key: &str, payloads: &[String], ttl: Duration) {
        let value = match serde_json::to_vec(payloads) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%key, %error, "could not encode answer list");
                return;
            }
        };

        if let Err(error) = self.inner.cache.set(key, value, ttl).await {
            tracing::debug!(%key, %error, "cache write failed");
        }
    }
}

impl Default for StubResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The records for an IP literal: the literal itself, typed by family,
/// with no TTL.  A restriction to the other family is an error.
fn literal_records(
    name: &str,
    address: IpAddr,
    restriction: Option<RecordType>,
) -> Result<Vec<Record>, ResolutionError> {
    let family = match address {
        IpAddr::V4(_) => RecordType::A,
        IpAddr::V6(_) => RecordType::AAAA,
    };

    match restriction {
        Some(rtype) if rtype != family => Err(ResolutionError::LiteralFamilyMismatch {
            name: name.to_string(),
            restriction: rtype,
        }),
        _ => Ok(vec![Record::new(name.to_string(), family, None)]),
    }
}

/// The name actually placed in the question: reverse-lookup form for PTR
/// queries on IP literals, normalised for address queries, untouched
/// otherwise.
fn question_name(name: &str, rtype: RecordType) -> Result<String, ResolutionError> {
    if rtype == RecordType::PTR {
        if let Ok(address) = name.parse::<IpAddr>() {
            return Ok(name::reverse_lookup_name(address));
        }
        return Ok(name.to_string());
    }

    if rtype == RecordType::A || rtype == RecordType::AAAA {
        return name::normalise(name);
    }

    Ok(name.to_string())
}

fn build_question(name: &str, rtype: RecordType) -> Result<Query, ResolutionError> {
    // The wire question is fully qualified.
    let absolute = if name.ends_with('.') {
        Name::from_ascii(name)
    } else {
        Name::from_ascii(format!("{name}."))
    };

    match absolute {
        Ok(wire_name) => Ok(Query::query(wire_name, rtype)),
        Err(_) => Err(ResolutionError::InvalidName {
            name: name.to_string(),
        }),
    }
}

fn cache_key(name: &str, rtype: RecordType) -> String {
    format!("{CACHE_KEY_PREFIX}{name}#{}", u16::from(rtype))
}

/// The presentation form of an answer payload: a dotted quad for A,
/// colon-hex for AAAA, the target name without its trailing dot for
/// name-valued records, the codec's presentation form for everything else.
fn record_data(rdata: &RData) -> String {
    let target = match rdata {
        RData::A(address) => return address.0.to_string(),
        RData::AAAA(address) => return address.0.to_string(),
        RData::CNAME(target) => target.0.to_string(),
        RData::NS(target) => target.0.to_string(),
        RData::PTR(target) => target.0.to_string(),
        _ => return rdata.to_string(),
    };

    target.strip_suffix('.').unwrap_or(&target).to_string()
}
