//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tailscribe/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tailscribe/` (~/.config/tailscribe/)
//! - Data: `$XDG_DATA_HOME/tailscribe/` (~/.local/share/tailscribe/)
//! - State/Logs: `$XDG_STATE_HOME/tailscribe/` (~/.local/state/tailscribe/)

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Conversation window settings
    #[serde(default)]
    pub view: ViewConfig,

    /// Active/idle detection
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Stream parser limits
    #[serde(default)]
    pub parser: ParserConfig,

    /// Persisted byte-offset cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transcript location overrides
    #[serde(default)]
    pub sources: SourceOverrides,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Conversation window configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ViewConfig {
    /// Number of trailing chunks exposed before "load earlier"
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
        }
    }
}

fn default_window_size() -> usize {
    200
}

/// Liveness configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    /// Seconds since the last merge before a session counts as inactive
    #[serde(default = "default_liveness_timeout")]
    pub timeout_secs: u64,

    /// How often the background ticker re-evaluates liveness
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Redirect focus to the most recently active session
    #[serde(default)]
    pub follow_active: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_liveness_timeout(),
            tick_interval_ms: default_tick_interval(),
            follow_active: false,
        }
    }
}

impl LivenessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_liveness_timeout() -> u64 {
    30
}

fn default_tick_interval() -> u64 {
    5000
}

/// Stream parser limits
#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    /// Lines longer than this are skipped with a warning
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Upper bound on bytes read from a source in one pass
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_read_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Offset cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Seed session offsets from the previous run
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Override for the cache database location
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            path: None,
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

/// Override paths for transcript directories
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SourceOverrides {
    /// Override path for Claude Code data (defaults to ~/.claude)
    pub claude_code_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.view.window_size == 0 {
            return Err(Error::Config(
                "view.window_size must be at least 1".to_string(),
            ));
        }
        if self.parser.max_line_bytes == 0 || self.parser.max_read_bytes == 0 {
            return Err(Error::Config(
                "parser limits must be greater than zero".to_string(),
            ));
        }
        if self.liveness.tick_interval_ms == 0 {
            return Err(Error::Config(
                "liveness.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Root of the Claude Code data directory (`~/.claude` unless overridden)
    pub fn claude_root(&self) -> PathBuf {
        self.sources
            .claude_code_path
            .clone()
            .unwrap_or_else(|| home_dir().join(".claude"))
    }

    /// Location of the offset cache database
    pub fn offset_cache_path(&self) -> PathBuf {
        self.cache
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("offsets.db"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tailscribe/config.toml` (~/.config/tailscribe/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tailscribe").join("config.toml")
    }

    /// Returns the data directory path (for the offset cache)
    ///
    /// `$XDG_DATA_HOME/tailscribe/` (~/.local/share/tailscribe/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tailscribe")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tailscribe/` (~/.local/state/tailscribe/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tailscribe")
    }

    /// Returns the log file written on `date`
    ///
    /// Logs roll daily: `$XDG_STATE_HOME/tailscribe/tailscribe.YYYY-MM-DD.log`
    pub fn log_path(date: NaiveDate) -> PathBuf {
        Self::state_dir().join(format!("tailscribe.{}.log", date.format("%Y-%m-%d")))
    }
}
