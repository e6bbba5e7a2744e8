//! Response cache keyed by the rounded query text.

use crate::error::CacheError;
use crate::relation::GraphRelation;
use crate::stats::SourceStats;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

static DATETIME_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)datetime\s+BETWEEN\s+'[^']*'\s+AND\s+'[^']*'").expect("valid datetime range regex")
});

/// Last minute digit and the seconds of a timestamp
static MINUTE_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d)\d:\d{2}").expect("valid timestamp regex"));

/// Cache key for a raw query. Timestamps inside the datetime range are
/// rounded down to ten minutes, so refreshes within one window share a key.
pub fn cache_key(raw: &str) -> String {
    let raw = raw.trim();
    DATETIME_RANGE
        .replace_all(raw, |caps: &regex::Captures| MINUTE_TAIL.replace_all(&caps[0], "${1}0:00").into_owned())
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub relations: Vec<GraphRelation>,
    pub stats: BTreeMap<String, SourceStats>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(relations: Vec<GraphRelation>, stats: BTreeMap<String, SourceStats>) -> Self {
        Self {
            relations,
            stats,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Creates or overwrites the entry
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;
}

/// In-process cache store with an optional time-to-live
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    fn expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now - entry.created_at >= ttl)
    }

    /// Drops expired entries, returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| !self.expired(entry, Utc::now()))
            .cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rounds_datetime_range() {
        let a = "FROM global WHERE ip='1.1.1.1' AND datetime BETWEEN '2023-01-01T10:21:37.000Z' AND '2023-01-02T10:21:37.000Z'";
        let b = "FROM global WHERE ip='1.1.1.1' AND datetime BETWEEN '2023-01-01T10:28:05.000Z' AND '2023-01-02T10:28:05.000Z'";

        assert_eq!(cache_key(a), cache_key(b));
        assert_eq!(
            cache_key(a),
            "FROM global WHERE ip='1.1.1.1' AND datetime BETWEEN '2023-01-01T10:20:00.000Z' AND '2023-01-02T10:20:00.000Z'"
        );
    }

    #[test]
    fn test_key_keeps_other_timestamps_and_windows() {
        let a = "FROM x WHERE seen='2023-01-01T10:21:37' AND datetime BETWEEN '2023-01-01T10:21:37.000Z' AND '2023-01-02T10:21:37.000Z'";
        assert!(cache_key(a).starts_with("FROM x WHERE seen='2023-01-01T10:21:37'"));

        let early = "FROM x WHERE a=1 AND datetime BETWEEN '2023-01-01T10:19:59.000Z' AND '2023-01-02T10:19:59.000Z'";
        let late = "FROM x WHERE a=1 AND datetime BETWEEN '2023-01-01T10:20:00.000Z' AND '2023-01-02T10:20:00.000Z'";
        assert_ne!(cache_key(early), cache_key(late));
    }

    #[test]
    fn test_key_without_range_is_trimmed_text() {
        assert_eq!(cache_key("  FROM x WHERE a=1 "), "FROM x WHERE a=1");
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip_and_overwrite() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").await.unwrap().is_none());

        cache.put("k", CacheEntry::new(Vec::new(), BTreeMap::new())).await.unwrap();
        let mut stats = BTreeMap::new();
        stats.insert("src".to_string(), SourceStats::default());
        cache.put("k", CacheEntry::new(Vec::new(), stats)).await.unwrap();

        let entry = cache.get("k").await.unwrap().unwrap();
        assert_eq!(entry.stats.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden_and_purged() {
        let cache = MemoryCache::with_ttl(Duration::seconds(60));
        let mut old = CacheEntry::new(Vec::new(), BTreeMap::new());
        old.created_at = Utc::now() - Duration::seconds(120);
        cache.put("old", old).await.unwrap();
        cache.put("fresh", CacheEntry::new(Vec::new(), BTreeMap::new())).await.unwrap();

        assert!(cache.get("old").await.unwrap().is_none());
        assert!(cache.get("fresh").await.unwrap().is_some());
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
