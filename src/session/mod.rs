//! Authenticated sessions against the login-gated target.
//!
//! A [`SessionManager`] owns one cookie jar and one set of credentials and
//! recovers from mid-request expiry with a single re-login. A [`SessionPool`]
//! hands a fixed number of them out one caller at a time.

mod login;
mod manager;
mod pool;
mod transport;

pub use login::{extract_login_form, Authenticator, FormLogin, LoginForm};
pub use manager::{SessionManager, SessionSnapshot, SessionState, SessionTimeouts};
pub use pool::{MaintenanceReport, Outcome, PoolSettings, PoolStats, SessionLease, SessionPool};
pub use transport::{Credentials, Transport, TransportSettings, DEFAULT_USER_AGENT};

#[cfg(test)]
pub(crate) use manager::tests as test_support;
