use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub app: AppConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Scope the app shell is served from; relative resource names resolve against it
  #[serde(default = "default_base_url")]
  pub base_url: String,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache generation name. Bumping it orphans the previous generation.
  #[serde(default = "default_cache_name")]
  pub name: String,
  /// App shell manifest populated on install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Path suffix of the network-first resource
  #[serde(default = "default_dynamic")]
  pub dynamic: String,
  /// Activate right after install instead of waiting for an explicit activate
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// Override for the cache database location
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      precache: default_precache(),
      dynamic: default_dynamic(),
      skip_waiting: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
  #[serde(default = "default_relay_url")]
  pub url: String,
  #[serde(default = "default_interval_ms")]
  pub interval_ms: u64,
  /// Title used when a relay message carries none
  #[serde(default = "default_title")]
  pub default_title: String,
  #[serde(default = "default_topic_prefix")]
  pub topic_prefix: String,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      url: default_relay_url(),
      interval_ms: default_interval_ms(),
      default_title: default_title(),
      topic_prefix: default_topic_prefix(),
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:8000/".to_string()
}

fn default_cache_name() -> String {
  "office-events-v1".to_string()
}

fn default_precache() -> Vec<String> {
  [
    "index.html",
    "styles.css",
    "app.js",
    "manifest.json",
    "events.json",
    "favicon-32x32.png",
    "favicon-16x16.png",
    "favicon.ico",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_dynamic() -> String {
  "events.json".to_string()
}

fn default_true() -> bool {
  true
}

fn default_relay_url() -> String {
  "https://ntfy.sh".to_string()
}

fn default_interval_ms() -> u64 {
  3000
}

fn default_title() -> String {
  "Office Event".to_string()
}

fn default_topic_prefix() -> String {
  "office-events-".to_string()
}

impl AppConfig {
  /// Parsed base URL. A trailing slash is added so relative names resolve inside the scope.
  pub fn base(&self) -> Result<Url> {
    let raw = if self.base_url.ends_with('/') {
      self.base_url.clone()
    } else {
      format!("{}/", self.base_url)
    };
    Url::parse(&raw).map_err(|e| eyre!("Invalid app base_url '{}': {}", self.base_url, e))
  }
}

impl RelayConfig {
  pub fn base(&self) -> Result<Url> {
    Url::parse(&self.url).map_err(|e| eyre!("Invalid relay url '{}': {}", self.url, e))
  }

  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./office-events.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/office-events/config.yaml
  ///
  /// Every field has a default, so no file at all is not an error.
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
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("office-events.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("office-events").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes as unit, not as an empty map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Directory for the cache database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("office-events"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.cache.name, "office-events-v1");
    assert_eq!(config.cache.precache.len(), 8);
    assert!(config.cache.skip_waiting);
    assert_eq!(config.relay.interval(), Duration::from_millis(3000));
    assert_eq!(config.relay.default_title, "Office Event");
  }

  #[test]
  fn test_partial_sections_fill_in_defaults() {
    let yaml = r#"
cache:
  name: office-events-v2
  skip_waiting: false
relay:
  url: https://relay.example.com
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.cache.name, "office-events-v2");
    assert!(!config.cache.skip_waiting);
    assert_eq!(config.cache.dynamic, "events.json");
    assert_eq!(config.relay.url, "https://relay.example.com");
    assert_eq!(config.relay.topic_prefix, "office-events-");
  }

  #[test]
  fn test_base_url_gains_trailing_slash() {
    let app = AppConfig {
      base_url: "https://example.com/office".to_string(),
    };
    let base = app.base().unwrap();
    assert_eq!(base.join("index.html").unwrap().as_str(), "https://example.com/office/index.html");
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/office-events.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
