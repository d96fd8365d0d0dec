use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{shlog_debug, Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2000;
const DEFAULT_STALE_LOCK_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one snapshot (and journal) per session.
    pub state_dir: Option<String>,
    pub max_retries: u32,
    pub cooldown_secs: u64,
    /// Plugin roots scanned for agents and skills. Empty means the built-in set.
    pub plugin_dirs: Vec<String>,
    pub journal: bool,
    pub lock_timeout_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            max_retries: DEFAULT_MAX_RETRIES,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            plugin_dirs: Vec::new(),
            journal: true,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
        }
    }
}

impl Config {
    /// Base directory, `$STAGEHAND_HOME` or `~/.stagehand`.
    pub fn base_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("STAGEHAND_HOME") {
            if !home.trim().is_empty() {
                return Ok(expand_tilde(&home));
            }
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".stagehand"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::base_dir()?.join("sessions")),
        }
    }

    pub fn plugin_roots(&self) -> Vec<PathBuf> {
        self.plugin_dirs.iter().map(|d| expand_tilde(d)).collect()
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        shlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            shlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if config.max_retries == 0 {
            return Err(Error::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }
        shlog_debug!(
            "Config loaded: state_dir={:?}, max_retries={}, cooldown_secs={}, plugin_dirs={}",
            config.state_dir,
            config.max_retries,
            config.cooldown_secs,
            config.plugin_dirs.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base = Self::base_dir()?;
        if !base.exists() {
            fs::create_dir_all(&base)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        shlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
