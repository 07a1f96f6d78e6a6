//! Configuration for uiprobe
//!
//! Everything the probe treats as tunable lives here: glitch thresholds and
//! budgets, sampling, consistency polling, the tmux connection, the DOM
//! conventions of the rendering app and logging. Every section is
//! `#[serde(default)]`, so an empty file is a valid config.
//!
//! ```toml
//! [glitch]
//! ignore = [".terminal-content", ".cursor"]
//! sample_interval_ms = 16
//!
//! [glitch.thresholds]
//! size_jump_px = 40.0
//!
//! [consistency]
//! timeout_ms = 5000
//!
//! [tmux]
//! session = "tmuxy"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classifier::{GlitchBudget, GlitchThresholds};
use crate::dom::KeyStrategy;
use crate::dom_snapshot::{DomSnapshotConfig, GeometryMode};
use crate::error::{ConfigError, Result};
use crate::logging::{LogConfig, LogLevel};
use crate::selector::Selector;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "UIPROBE_CONFIG";

/// File name searched in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "uiprobe.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for terminals
    #[default]
    Pretty,
    /// JSON lines for CI and log shipping
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub glitch: GlitchConfig,
    pub consistency: ConsistencyConfig,
    pub tmux: TmuxConfig,
    pub dom: DomSnapshotConfig,
    pub logging: LogConfig,
}

/// `[glitch]`: observation window defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlitchConfig {
    /// Root of the observed subtree
    pub scope: String,
    /// Elements whose size is sampled
    pub tracked: String,
    /// Subtrees excluded from observation (live terminal content, cursors)
    pub ignore: Vec<String>,
    /// Attributes tried in order when deriving element keys
    pub key_attributes: Vec<String>,
    pub sample_interval_ms: u64,
    pub thresholds: GlitchThresholds,
    /// Counts tolerated by `classify` before it reports instability
    pub budget: GlitchBudget,
}

impl Default for GlitchConfig {
    fn default() -> Self {
        Self {
            scope: "body".to_string(),
            tracked: "[data-pane-id]".to_string(),
            ignore: Vec::new(),
            key_attributes: KeyStrategy::default().attributes,
            sample_interval_ms: 16,
            thresholds: GlitchThresholds::default(),
            budget: GlitchBudget::default(),
        }
    }
}

/// `[consistency]`: propagation-lag tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub poll_backoff: f64,
    /// Compare pane content digests as well as structure
    pub compare_content: bool,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            poll_initial_ms: 50,
            poll_max_ms: 500,
            poll_backoff: 1.5,
            compare_content: false,
        }
    }
}

/// `[tmux]`: how to reach the authoritative server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    pub binary: String,
    /// `-L` socket name; the default server when unset
    pub socket: Option<String>,
    pub session: String,
    pub command_timeout_ms: u64,
    /// Report `__`-prefixed helper windows as group entities
    pub include_hidden_windows: bool,
    /// Capture pane text for content digests
    pub include_content: bool,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            socket: None,
            session: "tmuxy".to_string(),
            command_timeout_ms: 2000,
            include_hidden_windows: false,
            include_content: false,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from the resolved path, or defaults when no file exists.
    ///
    /// An explicit path that does not exist is still an error.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match resolve_config_path(None) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))?)
    }

    /// Check values serde cannot: selectors parse, intervals are positive,
    /// backoff is sane.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let glitch = &self.glitch;
        check_selector("glitch.scope", &glitch.scope)?;
        check_selector("glitch.tracked", &glitch.tracked)?;
        for selector in &glitch.ignore {
            check_selector("glitch.ignore", selector)?;
        }
        if glitch.sample_interval_ms == 0 {
            return Err(invalid("glitch.sample_interval_ms must be greater than 0"));
        }
        glitch.thresholds.validate()?;

        let consistency = &self.consistency;
        if consistency.timeout_ms == 0 {
            return Err(invalid("consistency.timeout_ms must be greater than 0"));
        }
        if consistency.poll_max_ms < consistency.poll_initial_ms {
            return Err(invalid(format!(
                "consistency.poll_max_ms ({}) is below poll_initial_ms ({})",
                consistency.poll_max_ms, consistency.poll_initial_ms
            )));
        }
        if !consistency.poll_backoff.is_finite() || consistency.poll_backoff < 1.0 {
            return Err(invalid(format!(
                "consistency.poll_backoff must be >= 1.0, got {}",
                consistency.poll_backoff
            )));
        }

        if self.tmux.session.trim().is_empty() {
            return Err(invalid("tmux.session must not be empty"));
        }
        if self.tmux.command_timeout_ms == 0 {
            return Err(invalid("tmux.command_timeout_ms must be greater than 0"));
        }

        let dom = &self.dom;
        for (field, selector) in [
            ("dom.scope", &dom.scope),
            ("dom.pane_selector", &dom.pane_selector),
            ("dom.window_selector", &dom.window_selector),
            ("dom.group_selector", &dom.group_selector),
        ] {
            check_selector(field, selector)?;
        }
        if let GeometryMode::Rect {
            cell_width,
            cell_height,
        } = dom.geometry
        {
            if !(cell_width > 0.0 && cell_height > 0.0) {
                return Err(invalid("dom.geometry cell sizes must be positive"));
            }
        }

        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|e| invalid(format!("logging.level: {e}")))?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn check_selector(field: &str, selector: &str) -> std::result::Result<(), ConfigError> {
    selector
        .parse::<Selector>()
        .map(drop)
        .map_err(|e| invalid(format!("{field}: {e}")))
}

/// Find the config file to use.
///
/// Order: explicit path, `$UIPROBE_CONFIG`, `./uiprobe.toml`,
/// `<config dir>/uiprobe/uiprobe.toml`. Only existing files are returned,
/// except the explicit path which is returned as given.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("uiprobe").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}
