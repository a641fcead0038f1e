//! Forge configuration, loaded from JSON with environment overrides.
//!
//! Every field has a default, so an empty object (or no file at all) is a
//! valid configuration. Environment variables win over the file:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CHROME_PATH` | `browser.executable` |
//! | `FORGE_TEMPLATE_DIR` | `template_dir` |
//! | `FORGE_MAX_CONCURRENCY` | `max_concurrent_renders` |
//! | `FORGE_RENDER_TIMEOUT_SECS` | `render_timeout_secs` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

/// Chrome for Testing release the managed download pins to.
pub const DEFAULT_BROWSER_VERSION: &str = "131.0.6778.85";

/// Where Chrome for Testing archives are published.
pub const DEFAULT_DOWNLOAD_BASE_URL: &str = "https://storage.googleapis.com/chrome-for-testing-public";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Directory templates are read from. `None` uses the bundled samples.
    pub template_dir: Option<PathBuf>,
    /// Keep compiled templates in memory keyed by name.
    pub cache_templates: bool,
    /// Upper bound on reports rendered at the same time.
    pub max_concurrent_renders: usize,
    /// Budget for one whole `generate_report` call.
    pub render_timeout_secs: u64,
    pub browser: BrowserConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            cache_templates: false,
            max_concurrent_renders: 4,
            render_timeout_secs: 60,
            browser: BrowserConfig::default(),
        }
    }
}

/// Browser acquisition and launch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Use this executable and skip any download.
    pub executable: Option<PathBuf>,
    /// Where downloaded browsers are unpacked. Defaults to the user cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Download a pinned headless shell when no executable is configured.
    /// When off, the system browser is used.
    pub download: bool,
    pub version: String,
    pub download_base_url: String,
    /// Keep Chromium's sandbox on. Off by default for container use.
    pub sandbox: bool,
    pub extra_args: Vec<String>,
    pub launch_timeout_secs: u64,
    pub font_ready_timeout_secs: u64,
    pub pool: PoolConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            cache_dir: None,
            download: true,
            version: DEFAULT_BROWSER_VERSION.to_string(),
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            sandbox: false,
            extra_args: Vec::new(),
            launch_timeout_secs: 30,
            font_ready_timeout_secs: 10,
            pool: PoolConfig::default(),
        }
    }
}

/// Session reuse. Disabled means one browser process per report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_sessions: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sessions: 2,
        }
    }
}

impl ForgeConfig {
    /// Parse configuration from a JSON string. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ForgeConfig =
            serde_json::from_str(json).map_err(|e| ForgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply the process environment on top of this configuration.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("CHROME_PATH").filter(|s| !s.is_empty()) {
            self.browser.executable = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("FORGE_TEMPLATE_DIR").filter(|s| !s.is_empty()) {
            self.template_dir = Some(PathBuf::from(dir));
        }
        if let Some(n) = lookup("FORGE_MAX_CONCURRENCY") {
            self.max_concurrent_renders = parse_env("FORGE_MAX_CONCURRENCY", &n)?;
        }
        if let Some(secs) = lookup("FORGE_RENDER_TIMEOUT_SECS") {
            self.render_timeout_secs = parse_env("FORGE_RENDER_TIMEOUT_SECS", &secs)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_renders == 0 {
            return Err(ForgeError::Config("max_concurrent_renders must be at least 1".into()));
        }
        if self.render_timeout_secs == 0 {
            return Err(ForgeError::Config("render_timeout_secs must be at least 1".into()));
        }
        if self.browser.launch_timeout_secs == 0 {
            return Err(ForgeError::Config("browser.launch_timeout_secs must be at least 1".into()));
        }
        if self.browser.pool.enabled && self.browser.pool.max_sessions == 0 {
            return Err(ForgeError::Config("browser.pool.max_sessions must be at least 1".into()));
        }
        Ok(())
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
}

impl BrowserConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn font_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.font_ready_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ForgeError::Config(format!("{key}={raw:?} is not a valid number")))
}
