//! Caching of encoded answer sets.
//!
//! The resolver stores one opaque byte entry per `(name, type)` pair and
//! only needs `get`/`set` with expiration from its cache, so the seam is a
//! small trait.  `SharedCache` is the default in-memory implementation;
//! anything with a TTL-bounded byte interface (memcached, redis, ...) can
//! stand in for it.

use async_trait::async_trait;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A TTL-bounded byte cache.
///
/// `get` never returns an expired entry: consumers treat "not present" and
/// "expired" identically.  The resolver swallows `set` errors and treats
/// `get` errors as misses, so an implementation over a fallible backend
/// degrades to "always miss" rather than failing lookups.
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

/// An error from a cache backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheError {
    pub message: String,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cache backend error: {}", self.message)
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// A convenience wrapper around a `MemoryCache` which lets it be shared
/// between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which refers to
/// the same underlying `MemoryCache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<MemoryCache>>,
}

impl SharedCache {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(MemoryCache::new())),
        }
    }

    /// Create a new cache with the given desired size.
    pub fn with_desired_size(desired_size: usize) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(MemoryCache::with_desired_size(desired_size))),
        }
    }

    /// Atomically clears expired entries and, if the cache has grown beyond
    /// its desired size, prunes least-recently-read entries to get down to
    /// size.
    ///
    /// Returns `(has overflowed?, current size, num expired, num pruned)`.
    pub fn prune(&self) -> (bool, usize, usize, usize) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).prune()
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for SharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.lock().expect(MUTEX_POISON_MESSAGE).get(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .insert(key, value, ttl);
        Ok(())
    }
}

/// An in-memory TTL cache for byte entries.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    /// The entries, by key.
    entries: HashMap<String, Entry>,

    /// Priority queue of keys ordered by read times.
    ///
    /// When the cache is full and there are no expired entries to prune,
    /// entries will instead be pruned in least-recently-read order.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    access_priority: PriorityQueue<String, Reverse<Instant>>,

    /// Priority queue of keys ordered by expiry time.
    ///
    /// When the cache is pruned, expired entries are removed first.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    expiry_priority: PriorityQueue<String, Reverse<Instant>>,

    /// The desired maximum number of entries in the cache.
    desired_size: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    value: Vec<u8>,
    expires: Instant,
}

impl MemoryCache {
    /// Create a new cache with a default desired size.
    pub fn new() -> Self {
        Self::with_desired_size(512)
    }

    /// Create a new cache with the given desired size.
    ///
    /// If the number of entries exceeds this, expired and
    /// least-recently-read entries will be pruned.
    ///
    /// Panics:
    ///
    /// - If called with a `desired_size` of 0.
    pub fn with_desired_size(desired_size: usize) -> Self {
        assert!(desired_size > 0, "cannot create a zero-size cache");

        Self {
            entries: HashMap::with_capacity(desired_size),
            access_priority: PriorityQueue::with_capacity(desired_size),
            expiry_priority: PriorityQueue::with_capacity(desired_size),
            desired_size,
        }
    }

    /// Get an entry from the cache.  An entry which has expired is removed
    /// and not returned.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();

        let entry = self.entries.get(key)?;
        if entry.expires <= now {
            self.remove(key);
            return None;
        }

        let value = entry.value.clone();
        self.access_priority.change_priority(key, Reverse(now));
        Some(value)
    }

    /// Insert an entry into the cache, replacing any previous entry under
    /// the same key.
    pub fn insert(&mut self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let expires = now + ttl;

        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.expires = expires;
            self.access_priority.change_priority(key, Reverse(now));
            self.expiry_priority.change_priority(key, Reverse(expires));
        } else {
            self.entries.insert(key.to_string(), Entry { value, expires });
            self.access_priority.push(key.to_string(), Reverse(now));
            self.expiry_priority.push(key.to_string(), Reverse(expires));
        }
    }

    /// The number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete all expired entries.
    ///
    /// Returns the number of entries deleted.
    pub fn remove_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut pruned = 0;

        while let Some((key, Reverse(expires))) = self.expiry_priority.pop() {
            if expires > now {
                self.expiry_priority.push(key, Reverse(expires));
                break;
            }

            self.entries.remove(&key);
            self.access_priority.remove(&key);
            pruned += 1;
        }

        pruned
    }

    /// Delete all expired entries, and then enough least-recently-read
    /// entries to reduce the cache to the desired size.
    ///
    /// Returns `(has overflowed?, current size, num expired, num pruned)`.
    pub fn prune(&mut self) -> (bool, usize, usize, usize) {
        let has_overflowed = self.entries.len() > self.desired_size;
        let num_expired = self.remove_expired();
        let mut num_pruned = 0;

        while self.entries.len() > self.desired_size {
            num_pruned += self.remove_least_recently_read();
        }

        (has_overflowed, self.entries.len(), num_expired, num_pruned)
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.access_priority.remove(key);
        self.expiry_priority.remove(key);
    }

    /// Helper for `prune`: deletes the least recently read entry.
    ///
    /// Returns the number of entries removed.
    fn remove_least_recently_read(&mut self) -> usize {
        if let Some((key, _)) = self.access_priority.pop() {
            self.expiry_priority.remove(&key);
            usize::from(self.entries.remove(&key).is_some())
        } else {
            0
        }
    }
}
