//! Cookie-carrying HTTP transport owned by one session.

use reqwest::cookie::{CookieStore, Jar};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

/// Default browser-like user agent; many login-gated sites reject bare clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

impl Credentials {
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &"<redacted>")
      .finish()
  }
}

/// Settings shared by every transport in a pool.
#[derive(Debug, Clone)]
pub struct TransportSettings {
  pub base_url: Url,
  pub user_agent: String,
  /// Per-request timeout
  pub timeout: Duration,
}

impl TransportSettings {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| Error::Config(format!("Invalid base url '{}': {}", base_url, e)))?;
    Ok(Self {
      base_url,
      user_agent: DEFAULT_USER_AGENT.to_string(),
      timeout,
    })
  }
}

/// HTTP client bound to one cookie jar.
///
/// Cloning is cheap and shares the jar; [`fresh`](Self::fresh) builds a new
/// client with an empty jar, which is how a session drops its cookies.
#[derive(Clone)]
pub struct Transport {
  client: reqwest::Client,
  jar: Arc<Jar>,
  settings: Arc<TransportSettings>,
}

impl Transport {
  pub fn new(settings: TransportSettings) -> Result<Self> {
    Self::build(Arc::new(settings))
  }

  fn build(settings: Arc<TransportSettings>) -> Result<Self> {
    let jar = Arc::new(Jar::default());
    let client = reqwest::Client::builder()
      .cookie_provider(Arc::clone(&jar))
      .user_agent(&settings.user_agent)
      .timeout(settings.timeout)
      .redirect(reqwest::redirect::Policy::limited(5))
      .gzip(true)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      jar,
      settings,
    })
  }

  /// Same settings, empty cookie jar.
  pub fn fresh(&self) -> Result<Self> {
    Self::build(Arc::clone(&self.settings))
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }

  pub fn base_url(&self) -> &Url {
    &self.settings.base_url
  }

  pub fn timeout(&self) -> Duration {
    self.settings.timeout
  }

  /// Resolve `path` (absolute or relative) against the base url.
  pub fn url(&self, path: &str) -> Result<Url> {
    self
      .settings
      .base_url
      .join(path)
      .map_err(|e| Error::Config(format!("Invalid path '{}': {}", path, e)))
  }

  /// Whether the jar holds any cookie for the base url.
  pub fn has_cookies(&self) -> bool {
    self.jar.cookies(&self.settings.base_url).is_some()
  }
}

impl fmt::Debug for Transport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transport")
      .field("base_url", &self.settings.base_url.as_str())
      .field("has_cookies", &self.has_cookies())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transport() -> Transport {
    let settings = TransportSettings::new("https://records.example/app/", Duration::from_secs(5)).unwrap();
    Transport::new(settings).unwrap()
  }

  #[test]
  fn joins_relative_and_absolute_paths() {
    let t = transport();
    assert_eq!(t.url("login").unwrap().as_str(), "https://records.example/app/login");
    assert_eq!(t.url("/login").unwrap().as_str(), "https://records.example/login");
  }

  #[test]
  fn fresh_transport_drops_cookies() {
    let t = transport();
    let url = t.base_url().clone();
    t.jar.add_cookie_str("PHPSESSID=abc; Path=/", &url);
    assert!(t.has_cookies());
    assert!(!t.fresh().unwrap().has_cookies());
  }

  #[test]
  fn credentials_debug_redacts_password() {
    let creds = Credentials::new("agent", "s3cret");
    let shown = format!("{:?}", creds);
    assert!(shown.contains("agent"));
    assert!(!shown.contains("s3cret"));
  }

  #[test]
  fn invalid_base_url_is_config_error() {
    assert!(matches!(
      TransportSettings::new("not a url", Duration::from_secs(1)),
      Err(Error::Config(_))
    ));
  }
}
