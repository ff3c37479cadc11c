//! Query types and deterministic cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The kinds of lookup a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
  /// Lookup by stable record identifier
  #[serde(alias = "id")]
  Identifier,
  /// Search by person name fragments
  Name,
  /// Reverse lookup by phone number (cache only)
  Phone,
}

impl QueryKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Identifier => "identifier",
      Self::Name => "name",
      Self::Phone => "phone",
    }
  }

  /// Kinds that may only be answered from cache, never from the network.
  pub fn is_cache_only(&self) -> bool {
    matches!(self, Self::Phone)
  }
}

impl fmt::Display for QueryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueryKind {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "identifier" | "id" => Ok(Self::Identifier),
      "name" => Ok(Self::Name),
      "phone" => Ok(Self::Phone),
      other => Err(format!("unknown query kind '{}'", other)),
    }
  }
}

/// A normalized query.
///
/// Parameters are normalized on construction, so two queries that differ only
/// in case or whitespace share a cache key. The values sent to the target keep
/// their original case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
  kind: QueryKind,
  params: BTreeMap<String, String>,
  wire: BTreeMap<String, String>,
}

impl Query {
  /// Build a query from raw parameters. Empty values are dropped.
  pub fn new<K, V>(kind: QueryKind, params: impl IntoIterator<Item = (K, V)>) -> Result<Self>
  where
    K: Into<String>,
    V: AsRef<str>,
  {
    let mut normalized = BTreeMap::new();
    let mut wire = BTreeMap::new();
    for (k, v) in params {
      let value = normalize_value(kind, v.as_ref());
      if value.is_empty() {
        continue;
      }
      let k = k.into();
      wire.insert(k.clone(), wire_value(kind, v.as_ref()));
      normalized.insert(k, value);
    }

    if normalized.is_empty() {
      return Err(Error::InvalidQuery(format!(
        "{} query needs at least one non-empty parameter",
        kind
      )));
    }

    Ok(Self {
      kind,
      params: normalized,
      wire,
    })
  }

  pub fn identifier(id: &str) -> Result<Self> {
    Self::new(QueryKind::Identifier, [("id", id)])
  }

  /// Name search. Any of the fragments may be empty, but not all of them.
  pub fn name(given: &str, paternal: &str, maternal: &str) -> Result<Self> {
    Self::new(
      QueryKind::Name,
      [("given", given), ("paternal", paternal), ("maternal", maternal)],
    )
  }

  pub fn phone(number: &str) -> Result<Self> {
    Self::new(QueryKind::Phone, [("number", number)])
  }

  pub fn kind(&self) -> QueryKind {
    self.kind
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  pub fn param(&self, name: &str) -> Option<&str> {
    self.params.get(name).map(String::as_str)
  }

  /// Parameter as it should be sent to the target: trimmed, case preserved.
  pub fn wire_param(&self, name: &str) -> Option<&str> {
    self.wire.get(name).map(String::as_str)
  }

  /// Stable cache key: `<kind>:<sha256 hex of the canonical form>`.
  ///
  /// Every name and value in the canonical form is length-prefixed, so no
  /// choice of parameter text can reproduce another query's form.
  pub fn cache_key(&self) -> String {
    let mut input = String::from(self.kind.as_str());
    for (k, v) in &self.params {
      input.push_str(&format!("|{}:{}={}:{}", k.len(), k, v.len(), v));
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{}:{}", self.kind, hex::encode(hasher.finalize()))
  }

  /// Human readable description for logs and errors.
  pub fn description(&self) -> String {
    let params: Vec<String> = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    format!("{} query [{}]", self.kind, params.join(", "))
  }
}

/// Normalize one parameter value for the given kind.
///
/// Phone numbers keep digits only. Everything else is trimmed, lowercased and
/// has internal whitespace collapsed to single spaces.
pub fn normalize_value(kind: QueryKind, raw: &str) -> String {
  match kind {
    QueryKind::Phone => raw.chars().filter(char::is_ascii_digit).collect(),
    _ => raw
      .split_whitespace()
      .collect::<Vec<_>>()
      .join(" ")
      .to_lowercase(),
  }
}

/// Value sent on the wire: whitespace collapsed, case kept.
fn wire_value(kind: QueryKind, raw: &str) -> String {
  match kind {
    QueryKind::Phone => normalize_value(kind, raw),
    _ => raw.split_whitespace().collect::<Vec<_>>().join(" "),
  }
}
