//! Error taxonomy for session, cache and resolution failures.

use crate::cache::Tier;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Longest diagnostic snippet kept from an unparseable response.
pub const DIAGNOSTIC_LIMIT: usize = 200;

/// Errors raised by the session, cache and fetch layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Bad credentials or an unrecoverable login failure.
  #[error("Authentication failed: {0}")]
  Authentication(String),

  /// The session expired again after the single re-login retry.
  #[error("Session expired: {0}")]
  SessionExpired(String),

  /// Timeout or connection failure.
  #[error("Network error: {0}")]
  Network(String),

  /// The target has no record for the query.
  #[error("Not found: {0}")]
  NotFound(String),

  /// The fetcher could not interpret a response.
  #[error("Parse error: {message} (response starts with: {snippet:?})")]
  Parse { message: String, snippet: String },

  /// Durable storage failure.
  #[error("Cache I/O error: {0}")]
  CacheIo(String),

  /// Every slot in the pool is quarantined.
  #[error("Session pool exhausted: all {0} sessions have failed")]
  PoolExhausted(usize),

  /// No slot became free within the acquire timeout.
  #[error("Timed out after {0:?} waiting for a free session")]
  PoolTimeout(std::time::Duration),

  /// Too many callers already waiting on the pool.
  #[error("Session pool busy: {0} callers already waiting")]
  PoolBusy(usize),

  #[error("Invalid query: {0}")]
  InvalidQuery(String),

  #[error("Invalid TTL for {tier} tier: {reason}")]
  InvalidTtl { tier: Tier, reason: String },

  #[error("Unsupported: {0}")]
  Unsupported(String),

  #[error("Config error: {0}")]
  Config(String),
}

impl Error {
  /// Build a parse error, keeping only the head of the offending body.
  pub fn parse(message: impl Into<String>, body: &str) -> Self {
    Error::Parse {
      message: message.into(),
      snippet: truncate(body, DIAGNOSTIC_LIMIT),
    }
  }

  /// Whether the caller may reasonably retry the same request later.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::SessionExpired(_)
        | Error::Network(_)
        | Error::PoolExhausted(_)
        | Error::PoolTimeout(_)
        | Error::PoolBusy(_)
    )
  }

  /// Whether the session that produced this error should be quarantined.
  pub fn is_session_fatal(&self) -> bool {
    matches!(
      self,
      Error::Authentication(_) | Error::SessionExpired(_) | Error::Network(_)
    )
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Error::Network(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::CacheIo(e.to_string())
  }
}

/// A failed resolution, with enough context to decide whether to retry.
#[derive(Debug, thiserror::Error)]
#[error("{query} (checked {tier_checked} tier): {source}")]
pub struct ResolveError {
  /// Human readable description of the query.
  pub query: String,
  /// The cache tier consulted before the failure.
  pub tier_checked: Tier,
  #[source]
  pub source: Error,
}

impl ResolveError {
  pub fn is_retryable(&self) -> bool {
    self.source.is_retryable()
  }
}

/// Truncate on a char boundary.
pub(crate) fn truncate(s: &str, limit: usize) -> String {
  match s.char_indices().nth(limit) {
    Some((idx, _)) => s[..idx].to_string(),
    None => s.to_string(),
  }
}
