use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REFRESH_SECS: u64 = 30;
const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(750);

/// Settings for one tracker. Immutable once handed to a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
  namespace: String,
  refresh_interval: Duration,
  cache_timeout: Duration,
  track_transitions: bool,
  verbose: bool,
  settle_delay: Duration,
}

impl TrackerConfig {
  /// Defaults: 30s refresh interval, 30s cache timeout, transitions tracked.
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
      cache_timeout: Duration::from_secs(DEFAULT_CACHE_TIMEOUT_SECS),
      track_transitions: true,
      verbose: false,
      settle_delay: DEFAULT_SETTLE_DELAY,
    }
  }

  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
    self.cache_timeout = timeout;
    self
  }

  pub fn with_transitions(mut self, enabled: bool) -> Self {
    self.track_transitions = enabled;
    self
  }

  pub fn with_verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }

  /// Grace period before a delayed load reads the source.
  pub fn with_settle_delay(mut self, delay: Duration) -> Self {
    self.settle_delay = delay;
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn refresh_interval(&self) -> Duration {
    self.refresh_interval
  }

  pub fn cache_timeout(&self) -> Duration {
    self.cache_timeout
  }

  pub fn track_transitions(&self) -> bool {
    self.track_transitions
  }

  pub fn verbose(&self) -> bool {
    self.verbose
  }

  pub fn settle_delay(&self) -> Duration {
    self.settle_delay
  }
}

/// Configuration file contents.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub source: SourceConfig,
  #[serde(default)]
  pub trackers: Vec<TrackerSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  /// Endpoint that resolves a batch of entity ids to counts
  pub url: String,
  #[serde(default = "default_http_timeout")]
  pub timeout_secs: u64,
}

impl SourceConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

/// One tracker entry in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
  pub namespace: String,
  #[serde(default = "default_refresh")]
  pub refresh_interval_secs: u64,
  #[serde(default = "default_cache_timeout")]
  pub cache_timeout_secs: u64,
  #[serde(default = "default_true")]
  pub track_transitions: bool,
  #[serde(default)]
  pub verbose: bool,
}

fn default_refresh() -> u64 {
  DEFAULT_REFRESH_SECS
}

fn default_cache_timeout() -> u64 {
  DEFAULT_CACHE_TIMEOUT_SECS
}

fn default_http_timeout() -> u64 {
  DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_true() -> bool {
  true
}

impl From<&TrackerSettings> for TrackerConfig {
  fn from(settings: &TrackerSettings) -> Self {
    TrackerConfig::new(&settings.namespace)
      .with_refresh_interval(Duration::from_secs(settings.refresh_interval_secs))
      .with_cache_timeout(Duration::from_secs(settings.cache_timeout_secs))
      .with_transitions(settings.track_transitions)
      .with_verbose(settings.verbose)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tallyd.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tallyd/config.yaml
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
        "No configuration file found. Create one at ~/.config/tallyd/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tallyd.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tallyd").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.source.url)
      .map_err(|e| eyre!("Invalid source url '{}': {}", self.source.url, e))?;

    if self.source.timeout_secs == 0 {
      return Err(eyre!("source.timeout_secs must be greater than zero"));
    }

    let mut seen = BTreeSet::new();
    for tracker in &self.trackers {
      if !seen.insert(tracker.namespace.as_str()) {
        return Err(eyre!("Duplicate tracker namespace: {}", tracker.namespace));
      }
      if tracker.refresh_interval_secs == 0 {
        return Err(eyre!(
          "refresh_interval_secs for {} must be greater than zero",
          tracker.namespace
        ));
      }
    }

    Ok(())
  }

  /// Tracker settings for a namespace, falling back to defaults when the
  /// namespace is not listed.
  pub fn tracker(&self, namespace: &str) -> TrackerConfig {
    self
      .trackers
      .iter()
      .find(|t| t.namespace == namespace)
      .map(TrackerConfig::from)
      .unwrap_or_else(|| TrackerConfig::new(namespace))
  }

  /// Get the bearer token for the count source from the environment.
  pub fn get_token() -> Option<String> {
    std::env::var("TALLYD_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
