//! Fixed-size pool of sessions with failure quarantine.

use futures::future::join_all;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::{SessionManager, SessionSnapshot, SessionState};
use crate::error::{Error, Result};

/// Pool behaviour knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
  /// How long `acquire` waits for a busy pool
  pub acquire_timeout: Duration,
  /// Fail fast once this many callers are already waiting
  pub max_waiters: Option<usize>,
  /// Sessions idle longer than this are renewed by housekeeping
  pub session_timeout: Duration,
  /// Whether housekeeping also retries failed sessions
  pub recover_failed: bool,
}

impl Default for PoolSettings {
  fn default() -> Self {
    Self {
      acquire_timeout: Duration::from_secs(30),
      max_waiters: None,
      session_timeout: Duration::from_secs(30 * 60),
      recover_failed: false,
    }
  }
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Success,
  /// Network or authentication failure; quarantine the session
  Fatal,
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
  pub total: usize,
  pub active: usize,
  pub failed: usize,
  pub in_use: usize,
  /// Share of sessions currently active, 0.0 to 1.0
  pub utilization: f64,
}

/// What a housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
  pub renewed: Vec<usize>,
  pub failed: Vec<usize>,
}

struct Slot {
  id: usize,
  status: Mutex<SessionSnapshot>,
  session: Arc<tokio::sync::Mutex<SessionManager>>,
}

impl Slot {
  fn snapshot(&self) -> SessionSnapshot {
    self
      .status
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn sync_from(&self, session: &SessionManager) {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner) = session.snapshot();
  }
}

/// Wakes pool waiters when dropped.
struct ReleaseSignal(Arc<Notify>);

impl Drop for ReleaseSignal {
  fn drop(&mut self) {
    self.0.notify_waiters();
  }
}

/// Exclusive use of one session.
///
/// Dropping the lease publishes the session's state to the pool and wakes
/// waiting callers. Prefer [`SessionPool::release`] so the outcome is recorded.
pub struct SessionLease {
  // Field order matters: the guard must be released before waiters are woken.
  guard: OwnedMutexGuard<SessionManager>,
  slot: Arc<Slot>,
  _signal: ReleaseSignal,
}

impl SessionLease {
  pub fn slot(&self) -> usize {
    self.slot.id
  }
}

impl Deref for SessionLease {
  type Target = SessionManager;

  fn deref(&self) -> &SessionManager {
    &self.guard
  }
}

impl DerefMut for SessionLease {
  fn deref_mut(&mut self) -> &mut SessionManager {
    &mut self.guard
  }
}

impl Drop for SessionLease {
  fn drop(&mut self) {
    self.slot.sync_from(&self.guard);
  }
}

/// Decrements the waiter count when a waiting caller gives up or succeeds.
struct WaiterTicket<'a>(&'a AtomicUsize);

impl Drop for WaiterTicket<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// A fixed set of sessions handed out one caller at a time.
pub struct SessionPool {
  slots: Vec<Arc<Slot>>,
  available: Arc<Notify>,
  waiters: AtomicUsize,
  settings: PoolSettings,
}

impl SessionPool {
  /// Build a pool without logging anything in; sessions log in lazily.
  pub fn new(sessions: Vec<SessionManager>, settings: PoolSettings) -> Self {
    let slots = sessions
      .into_iter()
      .enumerate()
      .map(|(id, session)| {
        Arc::new(Slot {
          id,
          status: Mutex::new(session.snapshot()),
          session: Arc::new(tokio::sync::Mutex::new(session)),
        })
      })
      .collect();

    Self {
      slots,
      available: Arc::new(Notify::new()),
      waiters: AtomicUsize::new(0),
      settings,
    }
  }

  /// Build a pool and log every session in concurrently.
  ///
  /// Sessions that fail to log in stay `Failed`; the pool is returned anyway.
  pub async fn initialize(mut sessions: Vec<SessionManager>, settings: PoolSettings) -> Self {
    info!(size = sessions.len(), "Initializing session pool");
    let results = join_all(sessions.iter_mut().map(|session| session.login())).await;

    let active = results.iter().filter(|r| r.is_ok()).count();
    for (id, result) in results.iter().enumerate() {
      if let Err(e) = result {
        warn!(session = id, "Initial login failed: {}", e);
      }
    }
    info!(active, total = sessions.len(), "Session pool initialized");

    Self::new(sessions, settings)
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn settings(&self) -> &PoolSettings {
    &self.settings
  }

  pub fn snapshots(&self) -> Vec<SessionSnapshot> {
    self.slots.iter().map(|slot| slot.snapshot()).collect()
  }

  /// Borrow a session.
  ///
  /// Prefers the valid session used least recently, then any session that is
  /// not `Failed` (it will log in lazily). Waits up to the acquire timeout
  /// while every usable session is busy.
  pub async fn acquire(&self) -> Result<SessionLease> {
    let deadline = Instant::now() + self.settings.acquire_timeout;
    let mut ticket: Option<WaiterTicket<'_>> = None;

    loop {
      let notified = self.available.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(lease) = self.try_acquire()? {
        return Ok(lease);
      }

      if ticket.is_none() {
        let waiting = self.waiters.fetch_add(1, Ordering::SeqCst);
        ticket = Some(WaiterTicket(&self.waiters));
        if let Some(max) = self.settings.max_waiters {
          if waiting >= max {
            return Err(Error::PoolBusy(waiting));
          }
        }
        debug!(waiting = waiting + 1, "All sessions busy, waiting");
      }

      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return Err(Error::PoolTimeout(self.settings.acquire_timeout));
      }
    }
  }

  /// Non-blocking acquire. `Ok(None)` means every usable session is busy.
  pub fn try_acquire(&self) -> Result<Option<SessionLease>> {
    let now = Instant::now();
    let mut candidates: Vec<(bool, Option<Instant>, &Arc<Slot>)> = self
      .slots
      .iter()
      .filter_map(|slot| {
        let snapshot = slot.snapshot();
        (snapshot.state != SessionState::Failed)
          .then(|| (!snapshot.is_valid_at(now), snapshot.last_used, slot))
      })
      .collect();

    if candidates.is_empty() {
      return Err(Error::PoolExhausted(self.slots.len()));
    }

    // Valid sessions first, then oldest use first (never-used sorts first).
    candidates.sort_by_key(|(invalid, last_used, slot)| (*invalid, *last_used, slot.id));

    for (_, _, slot) in candidates {
      if let Ok(guard) = Arc::clone(&slot.session).try_lock_owned() {
        debug!(session = slot.id, "Session acquired");
        return Ok(Some(self.lease(slot, guard)));
      }
    }
    Ok(None)
  }

  /// Return a session, recording how its use went.
  pub fn release(&self, mut lease: SessionLease, outcome: Outcome) {
    lease.touch();
    if outcome == Outcome::Fatal {
      warn!(session = lease.slot(), "Quarantining session after fatal error");
      lease.mark_failed();
    }
    drop(lease);
  }

  /// Drop cookies and log the session in `slot` in again.
  pub async fn renew(&self, slot: usize) -> Result<()> {
    let slot = self
      .slots
      .get(slot)
      .ok_or_else(|| Error::InvalidQuery(format!("no session slot {}", slot)))?;

    let guard = tokio::time::timeout(
      self.settings.acquire_timeout,
      Arc::clone(&slot.session).lock_owned(),
    )
    .await
    .map_err(|_| Error::PoolTimeout(self.settings.acquire_timeout))?;

    let mut lease = self.lease(slot, guard);
    info!(session = slot.id, "Renewing session");
    lease.renew().await
  }

  /// Renew sessions idle past the session timeout, and failed ones when
  /// `recover_failed` is set. Busy sessions are skipped.
  pub async fn maintain(&self) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    let now = Instant::now();

    for slot in &self.slots {
      let snapshot = slot.snapshot();
      let due = match snapshot.state {
        SessionState::Failed => self.settings.recover_failed,
        SessionState::Active => snapshot
          .last_used
          .or(snapshot.login_time)
          .is_some_and(|t| now.duration_since(t) > self.settings.session_timeout),
        _ => false,
      };
      if !due {
        continue;
      }

      let Ok(guard) = Arc::clone(&slot.session).try_lock_owned() else {
        continue;
      };
      let mut lease = self.lease(slot, guard);
      match lease.renew().await {
        Ok(()) => report.renewed.push(slot.id),
        Err(e) => {
          warn!(session = slot.id, "Housekeeping renewal failed: {}", e);
          report.failed.push(slot.id);
        }
      }
    }

    if !report.renewed.is_empty() || !report.failed.is_empty() {
      info!(renewed = ?report.renewed, failed = ?report.failed, "Pool housekeeping done");
    }
    report
  }

  /// Run [`maintain`](Self::maintain) every `interval` until the pool is dropped.
  pub fn spawn_housekeeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let pool: Weak<Self> = Arc::downgrade(self);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
          break;
        };
        pool.maintain().await;
      }
    })
  }

  pub fn stats(&self) -> PoolStats {
    let now = Instant::now();
    let total = self.slots.len();
    let mut stats = PoolStats {
      total,
      ..PoolStats::default()
    };

    for slot in &self.slots {
      let snapshot = slot.snapshot();
      if snapshot.is_valid_at(now) {
        stats.active += 1;
      }
      if snapshot.state == SessionState::Failed {
        stats.failed += 1;
      }
      if slot.session.try_lock().is_err() {
        stats.in_use += 1;
      }
    }

    if total > 0 {
      stats.utilization = stats.active as f64 / total as f64;
    }
    stats
  }

  fn lease(&self, slot: &Arc<Slot>, guard: OwnedMutexGuard<SessionManager>) -> SessionLease {
    SessionLease {
      guard,
      slot: Arc::clone(slot),
      _signal: ReleaseSignal(Arc::clone(&self.available)),
    }
  }
}
