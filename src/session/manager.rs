//! One authenticated session against the target.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::login::Authenticator;
use super::transport::{Credentials, Transport};
use crate::error::{Error, Result};
use crate::fetch::FetchOutcome;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
  /// Never logged in, or reset by a renewal
  Idle,
  LoggingIn,
  Active,
  /// The target reported the session gone; cookies were dropped
  Expired,
  /// Login failed or a fatal error was reported; needs an explicit renewal
  Failed,
}

impl fmt::Display for SessionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Idle => "idle",
      Self::LoggingIn => "logging-in",
      Self::Active => "active",
      Self::Expired => "expired",
      Self::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Point-in-time view of a session, readable without holding it.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
  pub id: usize,
  pub state: SessionState,
  pub username: String,
  pub login_time: Option<Instant>,
  pub last_used: Option<Instant>,
  pub expiry_deadline: Option<Instant>,
}

impl SessionSnapshot {
  /// Active and not past its expiry deadline.
  pub fn is_valid_at(&self, now: Instant) -> bool {
    self.state == SessionState::Active && self.expiry_deadline.is_some_and(|d| now < d)
  }
}

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
  /// How long a login stays trusted
  pub session: Duration,
  /// Upper bound on one request function run
  pub request: Duration,
  /// Upper bound on one whole login flow
  pub login: Duration,
}

impl Default for SessionTimeouts {
  fn default() -> Self {
    Self {
      session: Duration::from_secs(30 * 60),
      request: Duration::from_secs(30),
      login: Duration::from_secs(90),
    }
  }
}

/// Owns one authenticated channel: cookie jar, credentials and login state.
///
/// Every operation takes `&mut self`, so a session can never run two logins
/// or two requests at once. The pool hands sessions out behind an async
/// mutex to enforce that across tasks.
pub struct SessionManager {
  id: usize,
  state: SessionState,
  transport: Transport,
  credentials: Credentials,
  authenticator: Arc<dyn Authenticator>,
  timeouts: SessionTimeouts,
  login_time: Option<Instant>,
  last_used: Option<Instant>,
  expiry_deadline: Option<Instant>,
  login_count: u64,
}

impl SessionManager {
  pub fn new(
    id: usize,
    transport: Transport,
    credentials: Credentials,
    authenticator: Arc<dyn Authenticator>,
    timeouts: SessionTimeouts,
  ) -> Self {
    Self {
      id,
      state: SessionState::Idle,
      transport,
      credentials,
      authenticator,
      timeouts,
      login_time: None,
      last_used: None,
      expiry_deadline: None,
      login_count: 0,
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn transport(&self) -> &Transport {
    &self.transport
  }

  /// Number of login attempts made so far.
  pub fn login_count(&self) -> u64 {
    self.login_count
  }

  pub fn is_valid(&self) -> bool {
    self.snapshot().is_valid_at(Instant::now())
  }

  pub fn snapshot(&self) -> SessionSnapshot {
    SessionSnapshot {
      id: self.id,
      state: self.state,
      username: self.credentials.username.clone(),
      login_time: self.login_time,
      last_used: self.last_used,
      expiry_deadline: self.expiry_deadline,
    }
  }

  /// Log in with this session's credentials.
  ///
  /// Any failure, including transport errors and timeouts, leaves the session
  /// `Failed` and is reported as [`Error::Authentication`].
  pub async fn login(&mut self) -> Result<()> {
    self.state = SessionState::LoggingIn;
    self.login_count += 1;
    debug!(session = self.id, username = %self.credentials.username, "Logging in");

    let attempt = tokio::time::timeout(
      self.timeouts.login,
      self.authenticator.authenticate(&self.transport, &self.credentials),
    )
    .await;

    let failure = match attempt {
      Ok(Ok(())) => {
        let now = Instant::now();
        self.state = SessionState::Active;
        self.login_time = Some(now);
        self.expiry_deadline = Some(now + self.timeouts.session);
        info!(session = self.id, "Session active");
        return Ok(());
      }
      Ok(Err(Error::Authentication(reason))) => reason,
      Ok(Err(e)) => format!("login request failed: {}", e),
      Err(_) => format!("login timed out after {:?}", self.timeouts.login),
    };

    self.state = SessionState::Failed;
    self.expiry_deadline = None;
    warn!(session = self.id, reason = %failure, "Login failed");
    Err(Error::Authentication(failure))
  }

  /// Drop cookies and log in from scratch.
  pub async fn renew(&mut self) -> Result<()> {
    self.reset()?;
    self.login().await
  }

  /// Quarantine this session until it is renewed.
  pub fn mark_failed(&mut self) {
    self.state = SessionState::Failed;
  }

  pub fn touch(&mut self) {
    self.last_used = Some(Instant::now());
  }

  /// Run `request` with this session's transport, logging in first if needed.
  ///
  /// If the request reports the session expired, cookies are dropped, the
  /// session logs in once more and the request runs exactly once more. A
  /// second expiry is returned as [`Error::SessionExpired`].
  ///
  /// Returns `Ok(None)` when the target has no record.
  pub async fn execute_authenticated<T, F, Fut>(&mut self, mut request: F) -> Result<Option<T>>
  where
    F: FnMut(Transport) -> Fut,
    Fut: Future<Output = Result<FetchOutcome<T>>>,
  {
    if !self.is_valid() {
      self.login().await?;
    }

    match self.run_once(&mut request).await? {
      FetchOutcome::Found(value) => return Ok(Some(value)),
      FetchOutcome::NotFound => return Ok(None),
      FetchOutcome::SessionExpired => {}
    }

    warn!(session = self.id, "Session expired mid-request, logging in again");
    self.state = SessionState::Expired;
    self.reset()?;
    self.login().await?;

    match self.run_once(&mut request).await? {
      FetchOutcome::Found(value) => Ok(Some(value)),
      FetchOutcome::NotFound => Ok(None),
      FetchOutcome::SessionExpired => {
        self.state = SessionState::Expired;
        self.expiry_deadline = None;
        Err(Error::SessionExpired(format!(
          "session {} expired again right after re-login",
          self.id
        )))
      }
    }
  }

  async fn run_once<T, F, Fut>(&mut self, request: &mut F) -> Result<FetchOutcome<T>>
  where
    F: FnMut(Transport) -> Fut,
    Fut: Future<Output = Result<FetchOutcome<T>>>,
  {
    let result = tokio::time::timeout(self.timeouts.request, request(self.transport.clone())).await;
    self.touch();

    result.map_err(|_| {
      Error::Network(format!(
        "request on session {} timed out after {:?}",
        self.id, self.timeouts.request
      ))
    })?
  }

  /// Back to `Idle` with an empty cookie jar.
  fn reset(&mut self) -> Result<()> {
    self.transport = self.transport.fresh()?;
    self.state = SessionState::Idle;
    self.login_time = None;
    self.expiry_deadline = None;
    Ok(())
  }
}

impl fmt::Debug for SessionManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SessionManager")
      .field("id", &self.id)
      .field("state", &self.state)
      .field("username", &self.credentials.username)
      .field("login_count", &self.login_count)
      .finish()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::session::transport::TransportSettings;
  use async_trait::async_trait;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Authenticator that replays scripted results and counts calls.
  #[derive(Default)]
  pub(crate) struct ScriptedLogin {
    pub calls: AtomicUsize,
    script: Mutex<VecDeque<Result<()>>>,
  }

  impl ScriptedLogin {
    pub(crate) fn always_ok() -> Arc<Self> {
      Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
      let login = Self::default();
      for _ in 0..64 {
        login
          .script
          .lock()
          .unwrap()
          .push_back(Err(Error::Authentication("bad credentials".into())));
      }
      Arc::new(login)
    }

    pub(crate) fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Authenticator for ScriptedLogin {
    async fn authenticate(&self, _transport: &Transport, _credentials: &Credentials) -> Result<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
  }

  pub(crate) fn manager(id: usize, auth: Arc<dyn Authenticator>) -> SessionManager {
    let settings = TransportSettings::new("http://127.0.0.1:9/", Duration::from_secs(5)).unwrap();
    SessionManager::new(
      id,
      Transport::new(settings).unwrap(),
      Credentials::new("agent", "secret"),
      auth,
      SessionTimeouts::default(),
    )
  }

  /// Request function replaying `outcomes` in order and counting runs.
  fn scripted_request(
    outcomes: Vec<FetchOutcome<u32>>,
    runs: Arc<AtomicUsize>,
  ) -> impl FnMut(Transport) -> std::future::Ready<Result<FetchOutcome<u32>>> {
    let mut outcomes: VecDeque<_> = outcomes.into();
    move |_transport| {
      runs.fetch_add(1, Ordering::SeqCst);
      std::future::ready(Ok(outcomes.pop_front().unwrap_or(FetchOutcome::NotFound)))
    }
  }

  #[tokio::test]
  async fn lazy_login_before_first_request() {
    let auth = ScriptedLogin::always_ok();
    let mut session = manager(0, auth.clone());
    assert_eq!(session.state(), SessionState::Idle);

    let runs = Arc::new(AtomicUsize::new(0));
    let value = session
      .execute_authenticated(scripted_request(vec![FetchOutcome::Found(7)], runs.clone()))
      .await
      .unwrap();

    assert_eq!(value, Some(7));
    assert_eq!(auth.calls(), 1);
    assert!(session.is_valid());
  }

  #[tokio::test]
  async fn single_expiry_triggers_one_relogin_and_one_refetch() {
    let auth = ScriptedLogin::always_ok();
    let mut session = manager(0, auth.clone());
    session.login().await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let value = session
      .execute_authenticated(scripted_request(
        vec![FetchOutcome::SessionExpired, FetchOutcome::Found(42)],
        runs.clone(),
      ))
      .await
      .unwrap();

    assert_eq!(value, Some(42));
    assert_eq!(auth.calls(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), SessionState::Active);
  }

  #[tokio::test]
  async fn double_expiry_surfaces_without_third_attempt() {
    let auth = ScriptedLogin::always_ok();
    let mut session = manager(0, auth.clone());
    session.login().await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let err = session
      .execute_authenticated(scripted_request(
        vec![
          FetchOutcome::SessionExpired,
          FetchOutcome::SessionExpired,
          FetchOutcome::Found(1),
        ],
        runs.clone(),
      ))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::SessionExpired(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(auth.calls(), 2);
    assert!(!session.is_valid());
  }

  #[tokio::test]
  async fn failed_login_marks_session_failed() {
    let auth = ScriptedLogin::failing();
    let mut session = manager(3, auth.clone());

    let runs = Arc::new(AtomicUsize::new(0));
    let err = session
      .execute_authenticated(scripted_request(vec![FetchOutcome::Found(1)], runs.clone()))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Authentication(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn session_becomes_invalid_after_timeout() {
    let mut session = manager(0, ScriptedLogin::always_ok());
    session.login().await.unwrap();
    assert!(session.is_valid());

    tokio::time::advance(SessionTimeouts::default().session + Duration::from_secs(1)).await;
    assert!(!session.is_valid());
    assert_eq!(session.state(), SessionState::Active);
  }

  #[tokio::test(start_paused = true)]
  async fn slow_request_is_a_network_error() {
    let mut session = manager(0, ScriptedLogin::always_ok());
    session.login().await.unwrap();

    let err = session
      .execute_authenticated(|_transport| async {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(FetchOutcome::Found(1))
      })
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Network(_)));
  }

  #[tokio::test]
  async fn renew_resets_and_logs_in_again() {
    let auth = ScriptedLogin::always_ok();
    let mut session = manager(0, auth.clone());
    session.mark_failed();

    session.renew().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.login_count(), 1);
  }
}
