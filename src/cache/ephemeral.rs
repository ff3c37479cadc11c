//! Bounded, TTL-based in-memory tier.

use lru::LruCache;
use tokio::time::Instant;
use tracing::trace;

use super::traits::{CacheEntry, TierStats};

/// In-memory store evicting by insertion order.
///
/// Entries are only ever read with `peek`, so the LRU order of the underlying
/// cache is the insertion order. Capacity is enforced here rather than by the
/// `LruCache` so expired entries can be dropped before a live one is evicted.
pub struct EphemeralStore {
  entries: LruCache<String, CacheEntry>,
  max_entries: usize,
}

impl EphemeralStore {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: LruCache::unbounded(),
      max_entries: max_entries.max(1),
    }
  }

  pub fn max_entries(&self) -> usize {
    self.max_entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Live entry for `key`, if any.
  pub fn get(&self, key: &str, now: Instant) -> Option<&CacheEntry> {
    self
      .entries
      .peek(key)
      .filter(|entry| !entry.is_expired_at(now))
  }

  /// Admit an entry, returning the keys evicted to make room.
  ///
  /// Re-setting an existing key replaces it and counts as a fresh insertion.
  pub fn insert(&mut self, entry: CacheEntry, now: Instant) -> Vec<String> {
    let mut evicted = Vec::new();
    self.entries.pop(&entry.key);

    if self.entries.len() >= self.max_entries {
      self.sweep(now);
    }

    while self.entries.len() >= self.max_entries {
      match self.entries.pop_lru() {
        Some((key, _)) => {
          trace!(key = %key, "Evicting oldest ephemeral entry");
          evicted.push(key);
        }
        None => break,
      }
    }

    self.entries.put(entry.key.clone(), entry);
    evicted
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    self.entries.pop(key)
  }

  /// Drop every expired entry, returning how many were removed.
  pub fn sweep(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_expired_at(now))
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      self.entries.pop(key);
    }
    expired.len()
  }

  pub fn clear(&mut self) -> usize {
    let count = self.entries.len();
    self.entries.clear();
    count
  }

  /// Keys from oldest to newest insertion.
  pub fn keys(&self) -> Vec<String> {
    self.entries.iter().rev().map(|(key, _)| key.clone()).collect()
  }

  pub fn stats(&self, now: Instant) -> TierStats {
    let mut stats = TierStats::default();
    for (_, entry) in self.entries.iter() {
      if entry.is_expired_at(now) {
        stats.expired += 1;
      } else {
        stats.live += 1;
      }
      stats.approx_bytes += entry.approx_bytes();
    }
    stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;

  fn entry(key: &str, ttl_secs: u64) -> CacheEntry {
    CacheEntry::ephemeral(key.to_string(), json!({ "key": key }), Duration::from_secs(ttl_secs))
  }

  #[tokio::test(start_paused = true)]
  async fn evicts_oldest_inserted_not_least_recently_read() {
    let mut store = EphemeralStore::new(2);
    store.insert(entry("a", 60), Instant::now());
    store.insert(entry("b", 60), Instant::now());

    // Reading "a" must not protect it
    assert!(store.get("a", Instant::now()).is_some());

    let evicted = store.insert(entry("c", 60), Instant::now());
    assert_eq!(evicted, vec!["a".to_string()]);
    assert_eq!(store.keys(), vec!["b", "c"]);
  }

  #[tokio::test(start_paused = true)]
  async fn never_grows_beyond_max() {
    let mut store = EphemeralStore::new(5);
    for i in 0..50 {
      store.insert(entry(&format!("k{i}"), 60), Instant::now());
      assert!(store.len() <= 5);
    }
    assert_eq!(store.keys(), vec!["k45", "k46", "k47", "k48", "k49"]);
  }

  #[tokio::test(start_paused = true)]
  async fn expired_entries_are_dropped_before_live_ones() {
    let mut store = EphemeralStore::new(2);
    store.insert(entry("short", 1), Instant::now());
    store.insert(entry("long", 600), Instant::now());

    tokio::time::advance(Duration::from_secs(2)).await;

    let evicted = store.insert(entry("new", 600), Instant::now());
    assert!(evicted.is_empty());
    assert_eq!(store.keys(), vec!["long", "new"]);
  }

  #[tokio::test(start_paused = true)]
  async fn get_hides_expired_entries_before_sweep() {
    let mut store = EphemeralStore::new(10);
    store.insert(entry("a", 5), Instant::now());
    tokio::time::advance(Duration::from_secs(6)).await;

    assert!(store.get("a", Instant::now()).is_none());
    let stats = store.stats(Instant::now());
    assert_eq!((stats.live, stats.expired), (0, 1));

    assert_eq!(store.sweep(Instant::now()), 1);
    assert!(store.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn reinsert_moves_key_to_newest() {
    let mut store = EphemeralStore::new(2);
    store.insert(entry("a", 60), Instant::now());
    store.insert(entry("b", 60), Instant::now());
    store.insert(entry("a", 60), Instant::now());

    let evicted = store.insert(entry("c", 60), Instant::now());
    assert_eq!(evicted, vec!["b".to_string()]);
  }
}
