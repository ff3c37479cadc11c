//! Session-pooled, two-tier cached record retrieval from login-gated web
//! services.
//!
//! A caller asks the [`Orchestrator`] to resolve a [`Query`]. Cached answers
//! come from the permanent (SQLite) or ephemeral (in-memory, TTL-bound) tier.
//! Misses borrow a logged-in session from the [`SessionPool`], run the
//! [`Fetcher`] over it with one re-login on expiry, and write the result back.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod index;
pub mod logging;
pub mod orchestrator;
pub mod query;
pub mod session;

pub use cache::{CacheStore, Tier, TtlPolicy};
pub use error::{Error, ResolveError, Result};
pub use fetch::{FetchOutcome, Fetcher, HttpFetcher};
pub use orchestrator::{Orchestrator, Resolution};
pub use query::{Query, QueryKind};
pub use session::{SessionManager, SessionPool};
