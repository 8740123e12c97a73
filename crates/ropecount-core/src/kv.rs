//! KV client abstraction for counter sets and hash-maps.
//!
//! The compactor needs exactly six operations from the KV, each atomic on
//! the server: random member lookup, atomic set-to-set move, member
//! add/remove, full hash read, and key deletion. [`KvStore`] is that
//! contract; [`MemoryKv`] backs tests and [`RedisKv`] backs production.
//!
//! Every backend namespaces keys with a prefix fixed once per session, so
//! multiple deployments (and test runs) can share one server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Namespace prefix for all ropecount keys.
pub const KV_NAMESPACE: &str = "ropecount";

/// The set and hash-map operations the compactor depends on.
///
/// Each operation is atomic on the external KV. [`Error::Empty`] is the
/// in-band signal for "set or hash absent"; all other failures are
/// [`Error::Storage`].
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns an arbitrary member of `set`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] when the set is empty or absent.
    async fn random_set_member(&self, set: &str) -> Result<String>;

    /// Atomically moves `member` from `from` to `to`.
    ///
    /// Returns `1` if the member was moved, `0` if it was not in `from`
    /// (another actor already took it). This is the sole synchronization
    /// primitive between concurrent compactor workers.
    async fn move_set_member(&self, from: &str, to: &str, member: &str) -> Result<u64>;

    /// Removes `members` from `set`, returning how many were present.
    async fn remove_set_members(&self, set: &str, members: &[&str]) -> Result<u64>;

    /// Adds `members` to `set`, returning how many were new.
    async fn add_set_members(&self, set: &str, members: &[&str]) -> Result<u64>;

    /// Returns every field/count pair of the hash-map `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] when the hash-map is absent.
    async fn hash_get_all(&self, name: &str) -> Result<HashMap<String, i64>>;

    /// Deletes the given keys, returning how many existed.
    async fn del(&self, names: &[&str]) -> Result<u64>;
}

/// In-memory KV backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production. Sets and
/// hash-maps live in separate namespaces keyed by their full name; like
/// Redis, a set with no members ceases to exist.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, i64>>,
}

impl MemoryKv {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a set's members, for assertions in tests.
    #[must_use]
    pub fn set_members(&self, set: &str) -> Vec<String> {
        self.inner
            .read()
            .ok()
            .and_then(|state| state.sets.get(set).map(|s| s.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Snapshot of a hash-map's fields, for assertions in tests.
    #[must_use]
    pub fn hash(&self, name: &str) -> Option<HashMap<String, i64>> {
        self.inner
            .read()
            .ok()
            .and_then(|state| state.hashes.get(name).cloned())
    }

    /// Seeds a hash-map, standing in for the upstream counter writer.
    pub fn insert_hash(&self, name: &str, fields: HashMap<String, i64>) {
        if let Ok(mut state) = self.inner.write() {
            state.hashes.insert(name.to_string(), fields);
        }
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.inner
            .write()
            .map_err(|_| Error::storage("lock poisoned"))
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.inner
            .read()
            .map_err(|_| Error::storage("lock poisoned"))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn random_set_member(&self, set: &str) -> Result<String> {
        let state = self.read_state()?;
        state
            .sets
            .get(set)
            .and_then(|members| members.iter().next().cloned())
            .ok_or(Error::Empty)
    }

    async fn move_set_member(&self, from: &str, to: &str, member: &str) -> Result<u64> {
        let mut state = self.write_state()?;
        let removed = match state.sets.get_mut(from) {
            Some(members) => members.remove(member),
            None => false,
        };
        if !removed {
            return Ok(0);
        }
        if state.sets.get(from).is_some_and(HashSet::is_empty) {
            state.sets.remove(from);
        }
        state
            .sets
            .entry(to.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(1)
    }

    async fn remove_set_members(&self, set: &str, members: &[&str]) -> Result<u64> {
        let mut state = self.write_state()?;
        let Some(existing) = state.sets.get_mut(set) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if existing.remove(*member) {
                removed += 1;
            }
        }
        if existing.is_empty() {
            state.sets.remove(set);
        }
        Ok(removed)
    }

    async fn add_set_members(&self, set: &str, members: &[&str]) -> Result<u64> {
        let mut state = self.write_state()?;
        let existing = state.sets.entry(set.to_string()).or_default();
        let mut added = 0;
        for member in members {
            if existing.insert((*member).to_string()) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn hash_get_all(&self, name: &str) -> Result<HashMap<String, i64>> {
        let state = self.read_state()?;
        state.hashes.get(name).cloned().ok_or(Error::Empty)
    }

    async fn del(&self, names: &[&str]) -> Result<u64> {
        let mut state = self.write_state()?;
        let mut deleted = 0;
        for name in names {
            if state.hashes.remove(*name).is_some() || state.sets.remove(*name).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Production KV backend over a shared Redis connection.
///
/// Every key is namespaced with the session prefix. The connection manager
/// reconnects transparently, so one `RedisKv` can be shared for the
/// process lifetime.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisKv {
    /// Connects to a Redis server at `addr` (`host:port`) and namespaces
    /// every key with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the address is invalid or the
    /// initial connection fails.
    pub async fn connect(addr: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}"))
            .map_err(|e| Error::storage_with_source("invalid redis address", e))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| Error::storage_with_source("redis connection failed", e))?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn keys(&self, names: &[&str]) -> Vec<String> {
        names.iter().map(|n| self.key(n)).collect()
    }
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn redis_err(op: &str, e: redis::RedisError) -> Error {
    Error::storage_with_source(format!("{op} failed"), e)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn random_set_member(&self, set: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let member: Option<String> = redis::cmd("SRANDMEMBER")
            .arg(self.key(set))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SRANDMEMBER", e))?;
        member.ok_or(Error::Empty)
    }

    async fn move_set_member(&self, from: &str, to: &str, member: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("SMOVE")
            .arg(self.key(from))
            .arg(self.key(to))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SMOVE", e))
    }

    async fn remove_set_members(&self, set: &str, members: &[&str]) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(self.key(set))
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SREM", e))
    }

    async fn add_set_members(&self, set: &str, members: &[&str]) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(self.key(set))
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SADD", e))
    }

    async fn hash_get_all(&self, name: &str) -> Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(self.key(name))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("HGETALL", e))?;
        // Redis cannot hold an empty hash, so absent and empty collapse
        // into one signal here.
        if fields.is_empty() {
            return Err(Error::Empty);
        }
        Ok(fields)
    }

    async fn del(&self, names: &[&str]) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.keys(names))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("DEL", e))
    }
}
