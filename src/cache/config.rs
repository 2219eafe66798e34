//! Cache section of the configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::store::EvictionPolicy;
use crate::error::ConfigError;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Where cache commands go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// In-process store
  #[default]
  Builtin,
  /// An external Redis server
  Proxy,
}

/// Connection settings for `mode: proxy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheProxyConfig {
  pub host: String,
  pub port: u16,
  pub password: Option<String>,
  /// Logical Redis database index
  pub database: u8,
  pub tls_enabled: bool,
}

impl Default for CacheProxyConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 6379,
      password: None,
      database: 0,
      tls_enabled: false,
    }
  }
}

impl CacheProxyConfig {
  pub fn is_configured(&self) -> bool {
    !self.host.trim().is_empty()
  }

  /// `redis[s]://[:password@]host:port/db`
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = self
      .password
      .as_deref()
      .filter(|p| !p.is_empty())
      .map(|p| format!(":{}@", p))
      .unwrap_or_default();
    format!("{scheme}://{auth}{}:{}/{}", self.host, self.port, self.database)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub mode: CacheMode,
  /// Memory ceiling of the builtin store, e.g. `256mb` or `1gb`
  pub max_memory: String,
  pub eviction: EvictionPolicy,
  /// TTL in seconds given to keys the builtin store creates; 0 disables it
  pub default_ttl: u64,
  /// Seconds between expired-key sweeps of the builtin store; 0 leaves
  /// expiry to lookups
  pub sweep_interval: u64,
  pub proxy: CacheProxyConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      mode: CacheMode::Builtin,
      max_memory: "256mb".to_string(),
      eviction: EvictionPolicy::default(),
      default_ttl: 0,
      sweep_interval: 60,
      proxy: CacheProxyConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn max_memory_bytes(&self) -> usize {
    parse_memory_size(&self.max_memory).unwrap_or(256 * MB)
  }

  pub fn default_ttl(&self) -> Option<Duration> {
    (self.default_ttl > 0).then(|| Duration::from_secs(self.default_ttl))
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.mode == CacheMode::Proxy && !self.proxy.is_configured() {
      return Err(ConfigError::MissingCredentials(
        "cache.proxy.host is required in proxy mode".to_string(),
      ));
    }
    if parse_memory_size(&self.max_memory).is_none() {
      return Err(ConfigError::Load(format!(
        "invalid cache.max_memory '{}'",
        self.max_memory
      )));
    }
    Ok(())
  }
}

/// `"256mb"` / `"1 GB"` / `"4096"` to bytes. A bare number is bytes.
pub fn parse_memory_size(s: &str) -> Option<usize> {
  let s = s.trim().to_ascii_lowercase();
  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .unwrap_or(s.len());
  let (digits, unit) = s.split_at(split);
  let scale = match unit.trim() {
    "" | "b" => 1,
    "kb" | "k" => KB,
    "mb" | "m" => MB,
    "gb" | "g" => GB,
    _ => return None,
  };
  digits.parse::<usize>().ok()?.checked_mul(scale)
}

/// Human-readable byte count for log lines
pub fn format_memory_size(bytes: usize) -> String {
  match bytes {
    b if b >= GB => format!("{:.1}GB", b as f64 / GB as f64),
    b if b >= MB => format!("{:.1}MB", b as f64 / MB as f64),
    b if b >= KB => format!("{:.1}KB", b as f64 / KB as f64),
    b => format!("{}B", b),
  }
}
