//! Application configuration for batchscout.
//!
//! User config lives at `~/.batchscout/batchscout.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatchScoutError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "batchscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".batchscout";

// ---------------------------------------------------------------------------
// Config structs (matching batchscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch engine settings.
    #[serde(default)]
    pub batch: BatchSection,

    /// Research collaborator settings.
    #[serde(default)]
    pub crawl: CrawlSection,
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    /// Maximum number of jobs running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of pooled processing units.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Bounded wait per phase, in seconds. `0` disables the timeout.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_pool_size: default_max_pool_size(),
            phase_timeout_secs: default_phase_timeout_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_pool_size() -> usize {
    4
}
fn default_phase_timeout_secs() -> u64 {
    120
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Cap on links kept from the discovery page.
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// Pages fetched during extraction, root page included.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Regexes used to rank discovered links during selection.
    #[serde(default = "default_select_patterns")]
    pub select_patterns: Vec<String>,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Minimum ms between requests issued by one unit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,

    /// Allow localhost/private targets (disables SSRF protection).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            max_links: default_max_links(),
            max_pages: default_max_pages(),
            select_patterns: default_select_patterns(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_ms: default_rate_limit(),
            allow_private_hosts: false,
        }
    }
}

fn default_max_links() -> usize {
    200
}
fn default_max_pages() -> usize {
    8
}
fn default_select_patterns() -> Vec<String> {
    [
        "about", "team", "product", "pricing", "customer", "career", "contact", "blog", "news",
    ]
    .iter()
    .map(|p| (*p).to_string())
    .collect()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_rate_limit() -> u64 {
    200
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime batch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_concurrent: usize,
    pub max_pool_size: usize,
    pub phase_timeout: Option<Duration>,
}

impl BatchConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(BatchScoutError::config("max_concurrent must be at least 1"));
        }
        if self.max_pool_size == 0 {
            return Err(BatchScoutError::config("max_pool_size must be at least 1"));
        }
        Ok(())
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        let timeout = config.batch.phase_timeout_secs;
        Self {
            max_concurrent: config.batch.max_concurrent,
            max_pool_size: config.batch.max_pool_size,
            phase_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }
}

/// Runtime configuration for the HTTP research collaborator.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_links: usize,
    pub max_pages: usize,
    pub select_patterns: Vec<String>,
    pub request_timeout: Duration,
    pub rate_limit_ms: u64,
    pub allow_private_hosts: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_links: config.crawl.max_links,
            max_pages: config.crawl.max_pages.max(1),
            select_patterns: config.crawl.select_patterns.clone(),
            request_timeout: Duration::from_secs(config.crawl.request_timeout_secs),
            rate_limit_ms: config.crawl.rate_limit_ms,
            allow_private_hosts: config.crawl.allow_private_hosts,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.batchscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BatchScoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.batchscout/batchscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BatchScoutError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BatchScoutError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    write_default_config(&dir)
}

fn write_default_config(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| BatchScoutError::io(dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| BatchScoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BatchScoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_concurrent"));
        assert!(toml_str.contains("select_patterns"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.batch.max_concurrent, 4);
        assert_eq!(parsed.crawl.max_pages, 8);
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let toml_str = r#"
[batch]
max_concurrent = 2

[crawl]
allow_private_hosts = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.batch.max_concurrent, 2);
        assert_eq!(config.batch.max_pool_size, 4);
        assert!(config.crawl.allow_private_hosts);
        assert_eq!(config.crawl.rate_limit_ms, 200);
    }

    #[test]
    fn zero_timeout_disables_phase_timeout() {
        let mut app = AppConfig::default();
        assert_eq!(
            BatchConfig::from(&app).phase_timeout,
            Some(Duration::from_secs(120))
        );

        app.batch.phase_timeout_secs = 0;
        assert_eq!(BatchConfig::from(&app).phase_timeout, None);
    }

    #[test]
    fn batch_config_validation() {
        let mut config = BatchConfig::from(&AppConfig::default());
        assert!(config.validate().is_ok());

        config.max_concurrent = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn crawl_config_from_app_config() {
        let crawl = CrawlConfig::default();
        assert_eq!(crawl.max_links, 200);
        assert_eq!(crawl.request_timeout, Duration::from_secs(30));
        assert!(!crawl.allow_private_hosts);
    }

    #[test]
    fn write_and_load_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_default_config(dir.path()).expect("write config");
        let loaded = load_config_from(&path).expect("load config");
        assert_eq!(loaded.batch.phase_timeout_secs, 120);
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[batch\nmax_concurrent = ").expect("write");
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, BatchScoutError::Config { .. }));
    }
}
