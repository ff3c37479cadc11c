//! Core types for the two-tier cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::query::QueryKind;

/// Which tier an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  /// Durable, never auto-evicted
  Permanent,
  /// In-memory, TTL-bound and size-bounded
  Ephemeral,
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Tier::Permanent => f.write_str("permanent"),
      Tier::Ephemeral => f.write_str("ephemeral"),
    }
  }
}

impl FromStr for Tier {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "permanent" | "p" => Ok(Tier::Permanent),
      "ephemeral" | "e" => Ok(Tier::Ephemeral),
      other => Err(format!("unknown cache tier '{}'", other)),
    }
  }
}

/// A cached payload with its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub tier: Tier,
  pub payload: Value,
  /// When the entry was written
  pub created_at: DateTime<Utc>,
  /// Always `Some` for ephemeral entries, always `None` for permanent ones
  pub expires_at: Option<Instant>,
}

impl CacheEntry {
  pub fn permanent(key: String, payload: Value, created_at: DateTime<Utc>) -> Self {
    Self {
      key,
      tier: Tier::Permanent,
      payload,
      created_at,
      expires_at: None,
    }
  }

  pub fn ephemeral(key: String, payload: Value, ttl: Duration) -> Self {
    Self {
      key,
      tier: Tier::Ephemeral,
      payload,
      created_at: Utc::now(),
      expires_at: Some(Instant::now() + ttl),
    }
  }

  /// Permanent entries never expire.
  pub fn is_expired_at(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }

  /// Rough in-memory footprint of this entry.
  pub fn approx_bytes(&self) -> usize {
    self.key.len() + self.payload.to_string().len()
  }
}

/// Per-tier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
  /// Entries that would be served by `get`
  pub live: usize,
  /// Expired entries the sweep has not removed yet
  pub expired: usize,
  /// Approximate bytes held (ephemeral tier only)
  pub approx_bytes: usize,
}

/// Per-query-kind TTLs for ephemeral entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
  pub identifier: Duration,
  pub name: Duration,
  pub phone: Duration,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      identifier: Duration::from_secs(10 * 60),
      name: Duration::from_secs(5 * 60),
      phone: Duration::from_secs(15 * 60),
    }
  }
}

impl TtlPolicy {
  pub fn ttl_for(&self, kind: QueryKind) -> Duration {
    match kind {
      QueryKind::Identifier => self.identifier,
      QueryKind::Name => self.name,
      QueryKind::Phone => self.phone,
    }
  }
}
