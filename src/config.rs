use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiHelperConfig;
use crate::backoff::BackoffPolicy;
use crate::cache::{CacheConfig, EvictionPolicy};
use crate::connectivity::ConnectivityConfig;
use crate::queue::QueueConfig;
use crate::rate_limiter::{EndpointLimit, RateLimiterConfig};
use crate::request::RequestConfig;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiSection,
  pub cache: CacheSection,
  pub requests: RequestsSection,
  pub rate_limit: RateLimitSection,
  pub connectivity: ConnectivitySection,
  pub sync: SyncSection,
  pub prefetch: PrefetchSection,
  pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
  /// Root of the Pokédex REST API, without a trailing slash
  pub base_url: String,
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for ApiSection {
  fn default() -> Self {
    Self {
      base_url: "https://pokeapi.co/api/v2".to_string(),
      timeout_secs: 30,
      user_agent: concat!("pokedex-sync/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub max_size_bytes: usize,
  pub ttl_secs: u64,
  /// insertion_order or least_recently_used
  pub eviction: EvictionPolicy,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      max_size_bytes: 5 * 1024 * 1024,
      ttl_secs: 24 * 60 * 60,
      eviction: EvictionPolicy::InsertionOrder,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestsSection {
  pub max_concurrent: usize,
  pub max_retries: u32,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub queue_timeout_secs: u64,
}

impl Default for RequestsSection {
  fn default() -> Self {
    Self {
      max_concurrent: 4,
      max_retries: 3,
      base_backoff_ms: 1000,
      max_backoff_ms: 30_000,
      queue_timeout_secs: 120,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitSection {
  pub requests_per_minute: usize,
  pub minimum_delay_ms: u64,
}

impl Default for LimitSection {
  fn default() -> Self {
    Self {
      requests_per_minute: 60,
      minimum_delay_ms: 100,
    }
  }
}

impl From<LimitSection> for EndpointLimit {
  fn from(section: LimitSection) -> Self {
    EndpointLimit {
      minimum_delay: Duration::from_millis(section.minimum_delay_ms),
      ..EndpointLimit::per_minute(section.requests_per_minute)
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
  /// Limit for hosts without an entry in `hosts`
  #[serde(flatten)]
  pub default: LimitSection,
  pub max_queue_size: usize,
  /// Per-host overrides, e.g. `pokeapi.co`
  pub hosts: HashMap<String, LimitSection>,
}

impl Default for RateLimitSection {
  fn default() -> Self {
    Self {
      default: LimitSection::default(),
      max_queue_size: 100,
      hosts: HashMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivitySection {
  /// Set to null to trust the platform link without probing
  pub probe_url: Option<String>,
  pub probe_timeout_secs: u64,
  pub check_interval_secs: u64,
  pub offline_backoff_secs: u64,
  pub max_offline_backoff_secs: u64,
  pub max_consecutive_failures: u32,
}

impl Default for ConnectivitySection {
  fn default() -> Self {
    Self {
      probe_url: Some("https://pokeapi.co/api/v2/".to_string()),
      probe_timeout_secs: 5,
      check_interval_secs: 15,
      offline_backoff_secs: 30,
      max_offline_backoff_secs: 300,
      max_consecutive_failures: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
  pub batch_size: usize,
  pub interval_secs: u64,
  pub max_retries: u32,
  pub max_age_days: u64,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      batch_size: 10,
      interval_secs: 15 * 60,
      max_retries: 3,
      max_age_days: 7,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchSection {
  pub max_concurrent: usize,
  pub max_retries: u32,
}

impl Default for PrefetchSection {
  fn default() -> Self {
    Self {
      max_concurrent: 3,
      max_retries: 1,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSection {
  /// SQLite database file; defaults to the platform data directory
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pokedex.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pokedex/config.yaml
  ///
  /// Without any file the built-in defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pokedex.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pokedex").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.requests.max_concurrent == 0 {
      return Err(eyre!("requests.max_concurrent must be at least 1"));
    }
    if self.sync.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be at least 1"));
    }
    if self.rate_limit.default.requests_per_minute == 0 {
      return Err(eyre!("rate_limit.requests_per_minute must be at least 1"));
    }
    if let Some((host, _)) = self
      .rate_limit
      .hosts
      .iter()
      .find(|(_, limit)| limit.requests_per_minute == 0)
    {
      return Err(eyre!("rate_limit.hosts.{}.requests_per_minute must be at least 1", host));
    }
    url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("api.base_url is not a valid URL ({}): {}", self.api.base_url, e))?;
    Ok(())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Component settings for [`crate::api::ApiHelper::new`].
  pub fn api_helper_config(&self) -> ApiHelperConfig {
    let backoff = BackoffPolicy::new(
      Duration::from_millis(self.requests.base_backoff_ms),
      Duration::from_millis(self.requests.max_backoff_ms),
    );

    ApiHelperConfig {
      cache: CacheConfig {
        max_size_bytes: self.cache.max_size_bytes,
        ttl: Duration::from_secs(self.cache.ttl_secs),
        eviction: self.cache.eviction,
        ..CacheConfig::default()
      },
      requests: RequestConfig {
        max_concurrent_requests: self.requests.max_concurrent,
        default_timeout: self.request_timeout(),
        default_max_retries: self.requests.max_retries,
        backoff,
        queue_timeout: Duration::from_secs(self.requests.queue_timeout_secs),
        ..RequestConfig::default()
      },
      rate_limit: RateLimiterConfig {
        default_limit: self.rate_limit.default.into(),
        max_queue_size: self.rate_limit.max_queue_size,
        ..RateLimiterConfig::default()
      },
      endpoint_limits: self
        .rate_limit
        .hosts
        .iter()
        .map(|(host, limit)| (host.clone(), EndpointLimit::from(*limit)))
        .collect(),
      connectivity: ConnectivityConfig {
        probe_url: self.connectivity.probe_url.clone(),
        probe_timeout: Duration::from_secs(self.connectivity.probe_timeout_secs),
        check_interval: Duration::from_secs(self.connectivity.check_interval_secs),
        offline_backoff: BackoffPolicy::new(
          Duration::from_secs(self.connectivity.offline_backoff_secs),
          Duration::from_secs(self.connectivity.max_offline_backoff_secs),
        ),
        max_consecutive_failures: self.connectivity.max_consecutive_failures,
        ..ConnectivityConfig::default()
      },
      sync: SyncConfig {
        batch_size: self.sync.batch_size,
        max_retries: self.sync.max_retries,
        sync_interval: Duration::from_secs(self.sync.interval_secs),
        max_entry_age: Duration::from_secs(self.sync.max_age_days * 24 * 60 * 60),
        ..SyncConfig::default()
      },
      sync_fetch_timeout: self.request_timeout(),
    }
  }

  /// Work queue settings for bulk prefetching.
  pub fn prefetch_queue_config(&self) -> QueueConfig {
    QueueConfig {
      max_concurrent: self.prefetch.max_concurrent.max(1),
      max_retries: self.prefetch.max_retries,
      ..QueueConfig::default()
    }
  }
}
