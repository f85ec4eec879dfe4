//! In-Memory KV Store
//!
//! `KvStore` backed by a `DashMap`, with per-key expiry, string/set/sorted-set
//! values and a byte estimate standing in for `INFO memory`. Used by tests,
//! by the disabled client and as a local fallback backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::ports::{KeyTtl, KvBatch, KvOp, KvStore, MemoryInfo};
use crate::error::{Error, Result};
use crate::kv::glob_match;

/// Approximate per-key bookkeeping cost.
const KEY_OVERHEAD: u64 = 64;

/// Approximate per-member cost in sets.
const MEMBER_OVERHEAD: u64 = 16;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size(&self, key: &str) -> u64 {
        let payload = match &self.value {
            Value::Str(s) => s.len() as u64,
            Value::Set(members) => members
                .iter()
                .map(|m| m.len() as u64 + MEMBER_OVERHEAD)
                .sum(),
            Value::SortedSet(members) => members
                .keys()
                .map(|m| m.len() as u64 + MEMBER_OVERHEAD + 8)
                .sum(),
        };
        KEY_OVERHEAD + key.len() as u64 + payload
    }
}

fn wrong_type(key: &str) -> Error {
    Error::BackendUnavailable(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// In-memory KV store
pub struct MemoryKvStore {
    data: DashMap<String, Slot>,
    /// Reported `maxmemory` (0 = unlimited)
    max_bytes: AtomicU64,
    /// Failure injection: every command errors while set
    unavailable: AtomicBool,
    commands: AtomicU64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self {
            data: DashMap::new(),
            max_bytes: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            commands: AtomicU64::new(0),
        }
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store reporting the given `maxmemory`.
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        let store = Self::default();
        store.set_max_bytes(max_bytes);
        store
    }

    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    /// Make every subsequent command fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Estimated bytes held by live keys.
    pub fn used_bytes(&self) -> u64 {
        let now = Instant::now();
        self.data
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().size(entry.key()))
            .sum()
    }

    /// Live key count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands served so far.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Drop expired keys. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, slot| !slot.is_expired(now));
        before - self.data.len()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn check(&self) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a live slot, dropping it if it has expired.
    fn read<R>(&self, key: &str, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        let now = Instant::now();
        match self.data.get(key) {
            None => return None,
            Some(slot) if !slot.is_expired(now) => return Some(f(&slot)),
            Some(_) => {}
        }
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
        None
    }

    fn apply_set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.data.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn apply_del(&self, keys: &[String]) -> u64 {
        let now = Instant::now();
        keys.iter()
            .filter_map(|key| self.data.remove(key))
            .filter(|(_, slot)| !slot.is_expired(now))
            .count() as u64
    }

    fn apply_sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Set(BTreeSet::new())));
        if slot.is_expired(now) {
            *slot = Slot::new(Value::Set(BTreeSet::new()));
        }
        match &mut slot.value {
            Value::Set(set) => Ok(members
                .iter()
                .filter(|m| set.insert((*m).clone()))
                .count() as u64),
            _ => Err(wrong_type(key)),
        }
    }

    fn apply_srem(&self, key: &str, members: &[String]) -> Result<u64> {
        let now = Instant::now();
        let (removed, now_empty) = match self.data.get_mut(key) {
            None => return Ok(0),
            Some(slot) if slot.is_expired(now) => return Ok(0),
            Some(mut slot) => match &mut slot.value {
                Value::Set(set) => {
                    let removed = members.iter().filter(|m| set.remove(*m)).count() as u64;
                    (removed, set.is_empty())
                }
                _ => return Err(wrong_type(key)),
            },
        };
        if now_empty {
            self.data.remove(key);
        }
        Ok(removed)
    }

    fn apply_zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let now = Instant::now();
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::SortedSet(HashMap::new())));
        if slot.is_expired(now) {
            *slot = Slot::new(Value::SortedSet(HashMap::new()));
        }
        match &mut slot.value {
            Value::SortedSet(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn apply_expire(&self, key: &str, ttl: Duration) {
        if let Some(mut slot) = self.data.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
    }

    /// Members of a sorted set, highest score first.
    pub fn zrange_desc(&self, key: &str) -> Vec<(String, f64)> {
        self.read(key, |slot| match &slot.value {
            Value::SortedSet(members) => {
                let mut ranked: Vec<(String, f64)> =
                    members.iter().map(|(m, s)| (m.clone(), *s)).collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                ranked
            }
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        match self.read(key, |slot| slot.value.clone()) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.apply_set_ex(key, value, ttl);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        Ok(self.apply_del(keys))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .read(key, |slot| match slot.expires_at {
                None => KeyTtl::Persistent,
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
            })
            .unwrap_or(KeyTtl::Missing))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.check()?;
        self.apply_sadd(key, members)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        match self.read(key, |slot| slot.value.clone()) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.into_iter().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        self.check()?;
        match self.read(key, |slot| match &slot.value {
            Value::Set(set) => Some(set.len() as u64),
            _ => None,
        }) {
            None => Ok(0),
            Some(Some(count)) => Ok(count),
            Some(None) => Err(wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check()?;
        self.apply_zadd(key, member, score)
    }

    async fn execute(&self, batch: KvBatch) -> Result<()> {
        self.check()?;
        for op in batch.into_ops() {
            match op {
                KvOp::SetEx { key, value, ttl } => self.apply_set_ex(&key, &value, ttl),
                KvOp::Del { keys } => {
                    self.apply_del(&keys);
                }
                KvOp::SAdd { key, members } => {
                    self.apply_sadd(&key, &members)?;
                }
                KvOp::SRem { key, members } => {
                    self.apply_srem(&key, &members)?;
                }
                KvOp::ZAdd { key, member, score } => self.apply_zadd(&key, &member, score)?,
                KvOp::Expire { key, ttl } => self.apply_expire(&key, ttl),
            }
        }
        Ok(())
    }

    async fn memory_info(&self) -> Result<MemoryInfo> {
        self.check()?;
        Ok(MemoryInfo {
            used_bytes: self.used_bytes(),
            max_bytes: self.max_bytes.load(Ordering::Relaxed),
            fragmentation_ratio: 1.0,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_string_with_expiry() {
        let store = MemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(matches!(store.ttl("k").await.unwrap(), KeyTtl::Expires(_)));

        store.set_ex("short", "v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.ttl("short").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryKvStore::new();
        assert_eq!(store.sadd("s", &ids(&["a", "b", "a"])).await.unwrap(), 2);
        assert_eq!(store.scard("s").await.unwrap(), 2);
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::Persistent);

        let mut batch = KvBatch::new();
        batch.srem("s", ids(&["a", "b"]));
        store.execute(batch).await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), Vec::<String>::new());
        assert_eq!(store.scard("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(store.sadd("k", &ids(&["a"])).await.is_err());
    }

    #[tokio::test]
    async fn test_keys_pattern_sorted() {
        let store = MemoryKvStore::new();
        for key in ["lazy:employee:2", "lazy:employee:1", "cache:division:D1"] {
            store.set_ex(key, "{}", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(
            store.keys("lazy:*").await.unwrap(),
            ids(&["lazy:employee:1", "lazy:employee:2"])
        );
    }

    #[tokio::test]
    async fn test_memory_estimate_tracks_deletes() {
        let store = MemoryKvStore::with_max_bytes(10_000);
        store
            .set_ex("lazy:employee:1", &"x".repeat(500), Duration::from_secs(60))
            .await
            .unwrap();
        let before = store.memory_info().await.unwrap();
        assert_eq!(before.max_bytes, 10_000);

        store.del(&ids(&["lazy:employee:1"])).await.unwrap();
        let after = store.memory_info().await.unwrap();
        assert!(after.used_bytes < before.used_bytes);
    }

    #[tokio::test]
    async fn test_unavailable_injection() {
        let store = MemoryKvStore::new();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.unwrap_err().is_backend());

        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_sorted_set_ranking() {
        let store = MemoryKvStore::new();
        store.zadd("z", "employee:1", 3.0).await.unwrap();
        store.zadd("z", "employee:2", 9.0).await.unwrap();
        let ranked = store.zrange_desc("z");
        assert_eq!(ranked[0].0, "employee:2");
    }
}
