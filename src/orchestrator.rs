//! Query entry point: cache first, then a pooled session.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore, Tier};
use crate::error::{Error, ResolveError, Result};
use crate::fetch::Fetcher;
use crate::index::{self, PhoneIndex};
use crate::query::{Query, QueryKind};
use crate::session::{Outcome, PoolStats, SessionPool};

/// Result of one `resolve` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
  pub found: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  pub from_cache: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_tier: Option<Tier>,
  /// Set for cache-only lookups with no index entry; resolve by identifier first
  pub not_indexed: bool,
}

impl Resolution {
  fn cached(payload: Value, tier: Tier) -> Self {
    Self {
      found: true,
      payload: Some(payload),
      from_cache: true,
      cache_tier: Some(tier),
      not_indexed: false,
    }
  }

  fn fetched(payload: Value) -> Self {
    Self {
      found: true,
      payload: Some(payload),
      from_cache: false,
      cache_tier: None,
      not_indexed: false,
    }
  }

  fn not_found() -> Self {
    Self {
      found: false,
      payload: None,
      from_cache: false,
      cache_tier: None,
      not_indexed: false,
    }
  }

  fn not_indexed() -> Self {
    Self {
      not_indexed: true,
      ..Self::not_found()
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  /// Permanent records, phone index entries excluded
  pub permanent_count: usize,
  pub phone_index_count: usize,
  pub ephemeral_count: usize,
  pub ephemeral_expired: usize,
  pub ephemeral_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
  pub pool: PoolStats,
  pub cache: CacheStats,
}

/// Tiers consulted for a query kind, in order.
fn lookup_order(kind: QueryKind) -> &'static [Tier] {
  match kind {
    // Ephemeral holds identifier records whose permanent write failed
    QueryKind::Identifier => &[Tier::Permanent, Tier::Ephemeral],
    QueryKind::Name => &[Tier::Ephemeral],
    QueryKind::Phone => &[Tier::Ephemeral, Tier::Permanent],
  }
}

/// Resolves queries against the cache tiers and, on a miss, the target.
///
/// Cheap to clone; clones share the cache, pool and fetcher.
#[derive(Clone)]
pub struct Orchestrator {
  cache: CacheStore,
  pool: Arc<SessionPool>,
  fetcher: Arc<dyn Fetcher>,
  phones: Arc<PhoneIndex>,
}

impl Orchestrator {
  pub fn new(cache: CacheStore, pool: Arc<SessionPool>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      cache,
      pool,
      fetcher,
      phones: Arc::new(PhoneIndex::default()),
    }
  }

  pub fn with_phone_index(mut self, phones: PhoneIndex) -> Self {
    self.phones = Arc::new(phones);
    self
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn pool(&self) -> &Arc<SessionPool> {
    &self.pool
  }

  pub async fn resolve(&self, query: &Query) -> std::result::Result<Resolution, ResolveError> {
    if query.kind().is_cache_only() {
      return Ok(self.lookup_phone(query));
    }

    let key = query.cache_key();
    let tiers = lookup_order(query.kind());
    let mut tier_checked = tiers[0];

    for &tier in tiers {
      tier_checked = tier;
      if let Some(entry) = self.read(&key, tier) {
        debug!(key = %key, tier = %tier, "Cache hit");
        return Ok(Resolution::cached(entry.payload, tier));
      }
    }

    let fail = |source: Error| ResolveError {
      query: query.description(),
      tier_checked,
      source,
    };

    if !self.fetcher.supports(query.kind()) {
      return Err(fail(Error::Unsupported(format!(
        "no endpoint configured for {} queries",
        query.kind()
      ))));
    }

    let mut lease = self.pool.acquire().await.map_err(fail)?;
    let session = lease.slot();
    debug!(key = %key, session, "Cache miss, fetching");

    let fetcher = Arc::clone(&self.fetcher);
    let result = lease
      .execute_authenticated(|transport| {
        let fetcher = Arc::clone(&fetcher);
        let query = query.clone();
        async move { fetcher.fetch(&query, &transport).await }
      })
      .await;

    match result {
      Ok(Some(payload)) => {
        self.store(query, &key, &payload);
        self.pool.release(lease, Outcome::Success);
        info!(query = %query.description(), session, "Resolved from target");
        Ok(Resolution::fetched(payload))
      }
      Ok(None) => {
        self.pool.release(lease, Outcome::Success);
        debug!(query = %query.description(), "Target has no record");
        Ok(Resolution::not_found())
      }
      Err(e) => {
        let outcome = if e.is_session_fatal() {
          Outcome::Fatal
        } else {
          Outcome::Success
        };
        self.pool.release(lease, outcome);
        warn!(query = %query.description(), session, "Resolution failed: {}", e);
        Err(fail(e))
      }
    }
  }

  pub fn stats(&self) -> Result<Stats> {
    let phone_prefix = format!("{}:", QueryKind::Phone);
    let (phone_index, records): (Vec<String>, Vec<String>) = self
      .cache
      .list_keys(Tier::Permanent)?
      .into_iter()
      .partition(|key| key.starts_with(&phone_prefix));
    let ephemeral = self.cache.stats_for(Tier::Ephemeral)?;
    Ok(Stats {
      pool: self.pool.stats(),
      cache: CacheStats {
        permanent_count: records.len(),
        phone_index_count: phone_index.len(),
        ephemeral_count: ephemeral.live,
        ephemeral_expired: ephemeral.expired,
        ephemeral_bytes: ephemeral.approx_bytes,
      },
    })
  }

  pub fn invalidate(&self, key: &str, tier: Tier) -> Result<bool> {
    let removed = self.cache.delete(key, tier)?;
    info!(key, tier = %tier, removed, "Invalidated cache entry");
    Ok(removed)
  }

  pub fn purge(&self, tier: Tier) -> Result<usize> {
    let removed = self.cache.purge(tier)?;
    info!(tier = %tier, removed, "Purged cache tier");
    Ok(removed)
  }

  /// Cache read that degrades to a miss on storage failure.
  fn read(&self, key: &str, tier: Tier) -> Option<CacheEntry> {
    match self.cache.get(key, tier) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, tier = %tier, "Cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  /// Phone queries are answered from the index alone: the number itself
  /// first, then its national suffix, each across both tiers.
  fn lookup_phone(&self, query: &Query) -> Resolution {
    let digits = query.param("number").unwrap_or_default();

    for form in self.phones.forms(digits) {
      let Ok(candidate) = Query::phone(&form) else {
        continue;
      };
      let key = candidate.cache_key();
      for &tier in lookup_order(QueryKind::Phone) {
        let Some(entry) = self.read(&key, tier) else {
          continue;
        };
        if let Some(records) = self.follow_index(&entry) {
          debug!(key = %key, tier = %tier, "Phone index hit");
          return Resolution::cached(records, tier);
        }
      }
    }

    debug!(query = %query.description(), "Not indexed");
    Resolution::not_indexed()
  }

  /// Records an index entry points at, as a JSON array. `None` if all are gone.
  fn follow_index(&self, entry: &CacheEntry) -> Option<Value> {
    let records: Vec<Value> = index::referenced_keys(&entry.payload)
      .iter()
      .filter_map(|key| {
        lookup_order(QueryKind::Identifier)
          .iter()
          .find_map(|&tier| self.read(key, tier))
      })
      .map(|record| record.payload)
      .collect();

    (!records.is_empty()).then_some(Value::Array(records))
  }

  /// Write a fetched payload back. Failures are logged, never surfaced.
  fn store(&self, query: &Query, key: &str, payload: &Value) {
    let tier = match query.kind() {
      QueryKind::Identifier => match self.cache.set(key, Tier::Permanent, payload.clone(), None) {
        Ok(()) => Tier::Permanent,
        Err(e) => {
          warn!(key, "Permanent write failed, keeping result in memory: {}", e);
          let ttl = self.cache.ttl_for(QueryKind::Identifier);
          if let Err(e) = self.cache.set(key, Tier::Ephemeral, payload.clone(), Some(ttl)) {
            warn!(key, "Ephemeral write failed: {}", e);
            return;
          }
          Tier::Ephemeral
        }
      },
      kind => {
        let ttl = self.cache.ttl_for(kind);
        if let Err(e) = self.cache.set(key, Tier::Ephemeral, payload.clone(), Some(ttl)) {
          warn!(key, "Ephemeral write failed: {}", e);
        }
        return;
      }
    };

    self.index_phones(key, payload, tier);
  }

  fn index_phones(&self, identifier_key: &str, payload: &Value, tier: Tier) {
    for phone in self.phones.extract(payload) {
      let Ok(phone_query) = Query::phone(&phone) else {
        continue;
      };
      let phone_key = phone_query.cache_key();
      let ttl = match tier {
        Tier::Permanent => None,
        Tier::Ephemeral => Some(self.cache.ttl_for(QueryKind::Phone)),
      };
      let mut merge = |existing: Option<Value>| index::merged_entry(existing.as_ref(), identifier_key);
      match self.cache.update(&phone_key, tier, ttl, &mut merge) {
        Ok(()) => debug!(phone = %phone, tier = %tier, "Indexed phone"),
        Err(e) => warn!(phone = %phone, "Phone index write failed: {}", e),
      }
    }
  }
}
