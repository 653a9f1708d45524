//! Thread-Safe Storage Engine with Expiry Support
//!
//! This module implements the keyspace: a concurrent map from binary keys to
//! binary values, each with an optional deadline.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Keys are spread over independent shards, each behind
//!    its own `RwLock`. Writers to the same key always meet on the same lock,
//!    readers proceed concurrently.
//! 2. **Lazy Expiry**: A read that finds an expired entry removes it under the
//!    shard's write lock before reporting the key as absent.
//! 3. **Active Expiry**: The reaper calls [`StorageEngine::cleanup_expired`]
//!    with a single time sample per cycle.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Represents a stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Creates a new entry that expires `ttl` from now.
    ///
    /// A zero `ttl` yields an entry that is already expired.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    /// Checks whether this entry has expired as of `now`.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

/// The keyspace shared by every connection, the reaper and the replica link.
///
/// # Example
///
/// ```
/// use relaykv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("Ariz")));
///
/// engine.set_with_ttl(Bytes::from("session"), Bytes::from("abc123"), Duration::from_secs(60));
/// assert_eq!(engine.len(), 2);
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,

    /// Statistics: total number of keys (approximate)
    key_count: AtomicU64,

    /// Statistics: total GET operations
    get_count: AtomicU64,

    /// Statistics: total SET operations
    set_count: AtomicU64,

    /// Statistics: number of expired keys removed (lazily or by the reaper)
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a new, empty storage engine.
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn insert(&self, key: Bytes, entry: Entry) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(&key).data.write().unwrap();
        let is_new = data.insert(key, entry).is_none();
        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    /// Sets a key-value pair without expiry, replacing any existing entry
    /// (including its deadline).
    ///
    /// Returns `true` if a new key was created.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.insert(key, Entry::new(value))
    }

    /// Sets a key-value pair that expires after `ttl`.
    ///
    /// Returns `true` if a new key was created.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.insert(key, Entry::with_ttl(value, ttl))
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired; an expired
    /// entry is removed before returning.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);

        {
            let data = shard.data.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired under the read lock; re-check under the write lock since
        // another writer may have replaced the entry in between.
        let mut data = shard.data.write().unwrap();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Removes a key.
    ///
    /// Returns `true` if the key was present, expired or not.
    pub fn delete(&self, key: &Bytes) -> bool {
        let mut data = self.shard(key).data.write().unwrap();
        if data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Returns every key currently held, including expired entries that have
    /// not been reclaimed yet.
    pub fn keys(&self) -> Vec<Bytes> {
        self.shards
            .iter()
            .flat_map(|shard| {
                let data = shard.data.read().unwrap();
                data.keys().cloned().collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of live keys carrying a deadline.
    pub fn expiring_len(&self) -> u64 {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let data = shard.data.read().unwrap();
                data.values()
                    .filter(|e| e.expires_at.is_some() && !e.is_expired_at(now))
                    .count() as u64
            })
            .sum()
    }

    /// Returns the number of keys in the database (approximate).
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the database is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns database statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes every entry whose deadline is at or before `now`.
    ///
    /// Each shard is swept under its write lock. Returns the number of keys
    /// removed.
    pub fn cleanup_expired(&self, now: Instant) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write().unwrap();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired_at(now));
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total expired keys cleaned up
    pub expired: u64,
}
