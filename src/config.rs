use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::TtlPolicy;
use crate::fetch::{ResponseMarkers, Step};
use crate::query::QueryKind;
use crate::session::{Credentials, PoolSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub target: TargetConfig,
  #[serde(default)]
  pub credentials: Vec<CredentialConfig>,
  #[serde(default)]
  pub pool: PoolConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub fetch: FetchConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
  pub base_url: String,
  pub login_path: String,
  /// Page that only renders for logged-in sessions
  pub probe_path: String,
  /// Text on the probe page proving the login worked; at least one
  #[serde(default)]
  pub success_markers: Vec<String>,
  pub username_field: Option<String>,
  pub password_field: Option<String>,
  pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
  pub username: String,
  /// Falls back to GATECACHE_PASSWORD
  pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
  pub size: usize,
  pub acquire_timeout_secs: u64,
  pub max_waiters: Option<usize>,
  pub session_timeout_secs: u64,
  pub housekeeping_interval_secs: u64,
  pub recover_failed: bool,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      size: 4,
      acquire_timeout_secs: 30,
      max_waiters: None,
      session_timeout_secs: 30 * 60,
      housekeeping_interval_secs: 5 * 60,
      recover_failed: false,
    }
  }
}

impl PoolConfig {
  pub fn settings(&self) -> PoolSettings {
    PoolSettings {
      acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
      max_waiters: self.max_waiters,
      session_timeout: Duration::from_secs(self.session_timeout_secs),
      recover_failed: self.recover_failed,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite file (defaults to <data_dir>/gatecache/cache.db)
  pub path: Option<PathBuf>,
  /// When false the permanent tier stores nothing
  pub persistent: bool,
  pub max_ephemeral_entries: usize,
  pub sweep_interval_secs: u64,
  pub ttl: TtlConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      persistent: true,
      max_ephemeral_entries: 500,
      sweep_interval_secs: 60,
      ttl: TtlConfig::default(),
    }
  }
}

/// Ephemeral TTLs in seconds, per query kind
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
  pub identifier: u64,
  pub name: u64,
  pub phone: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      identifier: 600,
      name: 300,
      phone: 900,
    }
  }
}

impl TtlConfig {
  pub fn policy(&self) -> Result<TtlPolicy> {
    for (kind, secs) in [("identifier", self.identifier), ("name", self.name), ("phone", self.phone)] {
      if secs == 0 {
        return Err(eyre!("cache.ttl.{} must be greater than zero", kind));
      }
    }
    Ok(TtlPolicy {
      identifier: Duration::from_secs(self.identifier),
      name: Duration::from_secs(self.name),
      phone: Duration::from_secs(self.phone),
    })
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  /// Request steps per query kind; the last step's response is the result
  pub endpoints: HashMap<QueryKind, Vec<Step>>,
  pub not_found_markers: Vec<String>,
  pub expired_url_markers: Vec<String>,
  pub expired_body_markers: Vec<String>,
  /// JSON pointers to phone numbers in identifier records
  pub phone_paths: Vec<String>,
  /// Object key holding phone numbers anywhere in identifier records
  pub phone_field: Option<String>,
  /// Longer numbers are also indexed under this many trailing digits (0 disables)
  pub phone_suffix_digits: usize,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      endpoints: HashMap::new(),
      not_found_markers: Vec::new(),
      expired_url_markers: Vec::new(),
      expired_body_markers: Vec::new(),
      phone_paths: Vec::new(),
      phone_field: None,
      phone_suffix_digits: 9,
    }
  }
}

impl FetchConfig {
  pub fn markers(&self) -> ResponseMarkers {
    ResponseMarkers {
      expired_url: self.expired_url_markers.clone(),
      expired_body: self.expired_body_markers.clone(),
      not_found: self.not_found_markers.clone(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write daily-rotated log files here instead of stderr
  pub dir: Option<PathBuf>,
  /// tracing filter directive, e.g. "gatecache=debug"
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gatecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gatecache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/gatecache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("gatecache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gatecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.pool.size == 0 {
      return Err(eyre!("pool.size must be at least 1"));
    }
    if !config.target.success_markers.iter().any(|m| !m.trim().is_empty()) {
      return Err(eyre!("target.success_markers must list at least one non-empty marker"));
    }
    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.http.request_timeout_secs)
  }

  /// Credential pairs, with passwords filled from the environment.
  ///
  /// With no configured credentials, GATECACHE_USERNAME and
  /// GATECACHE_PASSWORD form a single pair.
  pub fn resolve_credentials(&self) -> Result<Vec<Credentials>> {
    if self.credentials.is_empty() {
      let username = std::env::var("GATECACHE_USERNAME").map_err(|_| {
        eyre!("No credentials configured. Add a credentials list or set GATECACHE_USERNAME.")
      })?;
      return Ok(vec![Credentials::new(username, Self::get_password()?)]);
    }

    self
      .credentials
      .iter()
      .map(|c| {
        let password = match &c.password {
          Some(p) => p.clone(),
          None => Self::get_password()?,
        };
        Ok(Credentials::new(c.username.clone(), password))
      })
      .collect()
  }

  /// Get the target password from environment variables.
  ///
  /// Checks GATECACHE_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("GATECACHE_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set GATECACHE_PASSWORD environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
target:
  base_url: https://records.example/
  login_path: index.php?view=login
  probe_path: index.php?view=home
  success_markers: ["Cerrar sesión"]
credentials:
  - username: agent1
    password: one
  - username: agent2
    password: two
"#;

  #[test]
  fn defaults_fill_missing_sections() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    assert_eq!(config.pool.size, 4);
    assert_eq!(config.pool.session_timeout_secs, 1800);
    assert!(!config.pool.recover_failed);
    assert_eq!(config.cache.max_ephemeral_entries, 500);
    assert!(config.cache.persistent);
    assert_eq!(config.cache.ttl.policy().unwrap(), TtlPolicy::default());
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert!(config.fetch.endpoints.is_empty());
    assert_eq!(config.fetch.phone_suffix_digits, 9);
  }

  #[test]
  fn full_config_parses() {
    let yaml = r#"
target:
  base_url: https://records.example/
  login_path: index.php?view=login
  probe_path: index.php?view=home
  success_markers: ["Generar Consulta"]
  username_field: usuario
pool:
  size: 2
  max_waiters: 8
cache:
  persistent: false
  ttl: { name: 120 }
fetch:
  endpoints:
    id:
      - method: POST
        path: index.php?action=validate
        form: { dni: "{id}" }
      - path: api/persona/{id}
    name:
      - path: api/buscar?nombres={given}
  expired_url_markers: ["view=login"]
  phone_paths: ["/telefonos"]
  phone_suffix_digits: 0
log:
  filter: gatecache=debug
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.pool.settings().max_waiters, Some(8));
    assert_eq!(config.cache.ttl.policy().unwrap().name, Duration::from_secs(120));
    assert_eq!(config.fetch.endpoints[&QueryKind::Identifier].len(), 2);
    assert_eq!(config.fetch.markers().expired_url, vec!["view=login"]);
    assert_eq!(config.target.username_field.as_deref(), Some("usuario"));
    assert_eq!(config.fetch.phone_suffix_digits, 0);
  }

  #[test]
  fn missing_or_blank_success_markers_are_rejected() {
    let without = MINIMAL.replace("  success_markers: [\"Cerrar sesión\"]\n", "");
    let err = Config::from_yaml(&without).unwrap_err();
    assert!(err.to_string().contains("success_markers"));

    let blank = MINIMAL.replace("[\"Cerrar sesión\"]", "[\"\", \"  \"]");
    assert!(Config::from_yaml(&blank).is_err());
  }

  #[test]
  fn configured_passwords_are_used() {
    let creds = Config::from_yaml(MINIMAL).unwrap().resolve_credentials().unwrap();
    assert_eq!(creds.len(), 2);
    assert_eq!(creds[1], Credentials::new("agent2", "two"));
  }

  #[test]
  fn zero_pool_or_ttl_is_rejected() {
    let yaml = format!("{}pool:\n  size: 0\n", MINIMAL);
    assert!(Config::from_yaml(&yaml).is_err());

    let ttl = TtlConfig {
      phone: 0,
      ..TtlConfig::default()
    };
    assert!(ttl.policy().is_err());
  }
}
