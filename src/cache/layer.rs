//! Two-tier cache store combining durable and in-memory tiers.

use serde_json::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ephemeral::EphemeralStore;
use super::storage::DurableStorage;
use super::traits::{CacheEntry, Tier, TierStats, TtlPolicy};
use crate::error::{Error, Result};
use crate::query::QueryKind;

/// Read-through/write-through cache with a permanent and an ephemeral tier.
///
/// The permanent tier never consults a clock and is only emptied by explicit
/// deletion. The ephemeral tier requires a TTL on every write, is swept
/// periodically and is bounded by entry count.
pub struct CacheStore {
  permanent: Arc<dyn DurableStorage>,
  ephemeral: Arc<RwLock<EphemeralStore>>,
  ttl_policy: TtlPolicy,
}

impl CacheStore {
  pub fn new<S: DurableStorage + 'static>(
    permanent: S,
    max_ephemeral_entries: usize,
    ttl_policy: TtlPolicy,
  ) -> Self {
    Self::with_storage(Arc::new(permanent), max_ephemeral_entries, ttl_policy)
  }

  pub fn with_storage(
    permanent: Arc<dyn DurableStorage>,
    max_ephemeral_entries: usize,
    ttl_policy: TtlPolicy,
  ) -> Self {
    Self {
      permanent,
      ephemeral: Arc::new(RwLock::new(EphemeralStore::new(max_ephemeral_entries))),
      ttl_policy,
    }
  }

  pub fn ttl_policy(&self) -> &TtlPolicy {
    &self.ttl_policy
  }

  /// TTL the ephemeral tier applies to results of this query kind.
  pub fn ttl_for(&self, kind: QueryKind) -> Duration {
    self.ttl_policy.ttl_for(kind)
  }

  pub fn get(&self, key: &str, tier: Tier) -> Result<Option<CacheEntry>> {
    match tier {
      Tier::Permanent => Ok(
        self
          .permanent
          .get(key)?
          .map(|record| CacheEntry::permanent(key.to_string(), record.payload, record.cached_at)),
      ),
      Tier::Ephemeral => Ok(self.read_ephemeral()?.get(key, Instant::now()).cloned()),
    }
  }

  /// Write an entry. Permanent writes take no TTL; ephemeral writes require one.
  pub fn set(&self, key: &str, tier: Tier, payload: Value, ttl: Option<Duration>) -> Result<()> {
    match check_ttl(tier, ttl)? {
      None => self.permanent.set(key, &payload),
      Some(ttl) => {
        let entry = CacheEntry::ephemeral(key.to_string(), payload, ttl);
        let evicted = self.write_ephemeral()?.insert(entry, Instant::now());
        log_evictions(evicted.len());
        Ok(())
      }
    }
  }

  /// Replace the entry under `key` with `merge(current payload)` as one step.
  ///
  /// Concurrent updates of the same key are serialized, so none is lost. An
  /// expired ephemeral entry counts as absent. TTL rules are those of [`set`](Self::set).
  pub fn update(
    &self,
    key: &str,
    tier: Tier,
    ttl: Option<Duration>,
    merge: &mut dyn FnMut(Option<Value>) -> Value,
  ) -> Result<()> {
    match check_ttl(tier, ttl)? {
      None => self.permanent.update(key, merge),
      Some(ttl) => {
        let now = Instant::now();
        let mut guard = self.write_ephemeral()?;
        let current = guard.get(key, now).map(|entry| entry.payload.clone());
        let entry = CacheEntry::ephemeral(key.to_string(), merge(current), ttl);
        let evicted = guard.insert(entry, now);
        drop(guard);
        log_evictions(evicted.len());
        Ok(())
      }
    }
  }

  /// Remove `key` from `tier`. Returns whether an entry existed.
  pub fn delete(&self, key: &str, tier: Tier) -> Result<bool> {
    match tier {
      Tier::Permanent => self.permanent.delete(key),
      Tier::Ephemeral => Ok(self.write_ephemeral()?.remove(key).is_some()),
    }
  }

  pub fn list_keys(&self, tier: Tier) -> Result<Vec<String>> {
    match tier {
      Tier::Permanent => self.permanent.list_keys(),
      Tier::Ephemeral => Ok(self.read_ephemeral()?.keys()),
    }
  }

  /// Drop every entry in `tier`.
  pub fn purge(&self, tier: Tier) -> Result<usize> {
    let removed = match tier {
      Tier::Permanent => self.permanent.clear()?,
      Tier::Ephemeral => self.write_ephemeral()?.clear(),
    };
    debug!(tier = %tier, removed, "Purged cache tier");
    Ok(removed)
  }

  pub fn stats_for(&self, tier: Tier) -> Result<TierStats> {
    match tier {
      Tier::Permanent => Ok(TierStats {
        live: self.permanent.list_keys()?.len(),
        ..TierStats::default()
      }),
      Tier::Ephemeral => Ok(self.read_ephemeral()?.stats(Instant::now())),
    }
  }

  /// Remove expired ephemeral entries now.
  pub fn sweep(&self) -> Result<usize> {
    let removed = self.write_ephemeral()?.sweep(Instant::now());
    if removed > 0 {
      debug!(removed, "Swept expired ephemeral entries");
    }
    Ok(removed)
  }

  /// Run [`sweep`](Self::sweep) every `interval` until the store is dropped.
  pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
    let ephemeral = Arc::downgrade(&self.ephemeral);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // First tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let Some(store) = ephemeral.upgrade() else {
          break;
        };
        let removed = match store.write() {
          Ok(mut guard) => guard.sweep(Instant::now()),
          Err(e) => {
            warn!("Ephemeral sweep skipped: {}", e);
            continue;
          }
        };
        if removed > 0 {
          debug!(removed, "Swept expired ephemeral entries");
        }
      }
    })
  }

  fn read_ephemeral(&self) -> Result<RwLockReadGuard<'_, EphemeralStore>> {
    self
      .ephemeral
      .read()
      .map_err(|e| Error::CacheIo(format!("Lock poisoned: {}", e)))
  }

  fn write_ephemeral(&self) -> Result<RwLockWriteGuard<'_, EphemeralStore>> {
    self
      .ephemeral
      .write()
      .map_err(|e| Error::CacheIo(format!("Lock poisoned: {}", e)))
  }
}

/// Validated TTL for a write to `tier`: `None` for permanent, the TTL for ephemeral.
fn check_ttl(tier: Tier, ttl: Option<Duration>) -> Result<Option<Duration>> {
  match (tier, ttl) {
    (Tier::Permanent, None) => Ok(None),
    (Tier::Permanent, Some(_)) => Err(Error::InvalidTtl {
      tier,
      reason: "permanent entries never expire".to_string(),
    }),
    (Tier::Ephemeral, None) => Err(Error::InvalidTtl {
      tier,
      reason: "ephemeral entries require a ttl".to_string(),
    }),
    (Tier::Ephemeral, Some(ttl)) if ttl.is_zero() => Err(Error::InvalidTtl {
      tier,
      reason: "ttl must be greater than zero".to_string(),
    }),
    (Tier::Ephemeral, Some(ttl)) => Ok(Some(ttl)),
  }
}

fn log_evictions(count: usize) {
  if count > 0 {
    debug!(count, "Ephemeral tier full, evicted oldest entries");
  }
}

impl Clone for CacheStore {
  fn clone(&self) -> Self {
    Self {
      permanent: Arc::clone(&self.permanent),
      ephemeral: Arc::clone(&self.ephemeral),
      ttl_policy: self.ttl_policy,
    }
  }
}
