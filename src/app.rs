use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheStore, DurableStorage, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::fetch::HttpFetcher;
use crate::index::PhoneIndex;
use crate::orchestrator::Orchestrator;
use crate::session::{
  FormLogin, SessionManager, SessionPool, SessionTimeouts, Transport, TransportSettings,
};

/// How the pool comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
  /// Log every session in before returning
  Eager,
  /// Sessions log in on first use
  Lazy,
}

/// Wires configuration into a running orchestrator plus its background tasks.
pub struct App {
  config: Config,
  orchestrator: Orchestrator,
  /// Sweeper and housekeeper, aborted on drop
  tasks: Vec<JoinHandle<()>>,
}

impl App {
  pub async fn new(config: Config, startup: Startup) -> Result<Self> {
    let cache = open_cache(&config)?;
    let pool = Arc::new(build_pool(&config, startup).await?);

    let fetcher = HttpFetcher::new(config.fetch.endpoints.clone(), config.fetch.markers());
    let phones = PhoneIndex::new(config.fetch.phone_paths.clone(), config.fetch.phone_field.clone())
      .with_suffix_digits(config.fetch.phone_suffix_digits);

    let orchestrator = Orchestrator::new(cache, pool, Arc::new(fetcher)).with_phone_index(phones);

    Ok(Self {
      config,
      orchestrator,
      tasks: Vec::new(),
    })
  }

  /// Start the ephemeral sweeper and the pool housekeeper.
  pub fn start_background(&mut self) {
    let sweep = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
    let housekeeping = Duration::from_secs(self.config.pool.housekeeping_interval_secs.max(1));

    self.tasks.push(self.orchestrator.cache().spawn_sweeper(sweep));
    self.tasks.push(self.orchestrator.pool().spawn_housekeeper(housekeeping));
    debug!(?sweep, ?housekeeping, "Background tasks started");
  }

  pub fn orchestrator(&self) -> &Orchestrator {
    &self.orchestrator
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}

impl Drop for App {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

/// Cache store with the configured permanent backend.
pub fn open_cache(config: &Config) -> Result<CacheStore> {
  let ttl_policy = config.cache.ttl.policy()?;

  let storage: Arc<dyn DurableStorage> = if config.cache.persistent {
    let path = match &config.cache.path {
      Some(p) => p.clone(),
      None => SqliteStorage::default_path()?,
    };
    info!(path = %path.display(), "Opening permanent cache");
    Arc::new(SqliteStorage::open_at(&path)?)
  } else {
    info!("Persistence disabled, permanent tier discards writes");
    Arc::new(NoopStorage)
  };

  Ok(CacheStore::with_storage(
    storage,
    config.cache.max_ephemeral_entries,
    ttl_policy,
  ))
}

/// One session per slot, credentials assigned round-robin.
pub async fn build_pool(config: &Config, startup: Startup) -> Result<SessionPool> {
  let credentials = config.resolve_credentials()?;
  if credentials.is_empty() {
    return Err(eyre!("At least one credential pair is required"));
  }

  let mut settings = TransportSettings::new(&config.target.base_url, config.request_timeout())?;
  if let Some(agent) = &config.target.user_agent {
    settings.user_agent = agent.clone();
  }

  let authenticator = Arc::new(
    FormLogin::new(&config.target.login_path, &config.target.probe_path)
      .with_success_markers(config.target.success_markers.clone())
      .with_fields(
        config.target.username_field.clone(),
        config.target.password_field.clone(),
      ),
  );

  let timeouts = SessionTimeouts {
    session: Duration::from_secs(config.pool.session_timeout_secs),
    request: config.request_timeout(),
    // Login is three round trips
    login: config.request_timeout() * 3,
  };

  let sessions = (0..config.pool.size)
    .map(|id| {
      let transport = Transport::new(settings.clone())?;
      Ok(SessionManager::new(
        id,
        transport,
        credentials[id % credentials.len()].clone(),
        authenticator.clone(),
        timeouts,
      ))
    })
    .collect::<Result<Vec<_>>>()?;

  let pool = match startup {
    Startup::Eager => SessionPool::initialize(sessions, config.pool.settings()).await,
    Startup::Lazy => SessionPool::new(sessions, config.pool.settings()),
  };
  Ok(pool)
}
