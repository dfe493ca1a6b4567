//! Run configuration loading for the runner.
//!
//! The alert configuration is a JSON document (or TOML, chosen by the `.toml`
//! extension) carrying the webhook target, the ordered pattern list, the
//! line-log path and cooldown defaults. It is loaded once at startup and never
//! mutated afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

/// Cooldown applied to a pattern configured with `timeoutMinutes = 0`.
///
/// Zero means "alert once, then never again for this pattern", so it maps to
/// a span far beyond any realistic process lifetime (100 years).
pub const NEVER_AGAIN: TimeDelta = TimeDelta::days(36_500);

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be decoded.
    #[error("failed to parse config file {path}: {detail}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Decoder error message.
        detail: String,
    },

    /// A pattern failed to compile as a regular expression.
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        /// Pattern source text.
        pattern: String,
        /// Regex compiler error.
        source: regex::Error,
    },

    /// A value is outside its allowed range or format.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One entry of the `patterns` list.
///
/// Accepts the legacy bare-string form as well as the detailed object form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatternConfig {
    /// Bare regular expression; uses the default cooldown.
    Plain(String),
    /// Regular expression with an optional per-pattern cooldown.
    Detailed {
        /// Regular expression source text.
        pattern: String,
        /// Cooldown in minutes. Absent means the default; zero means never again.
        #[serde(default, rename = "timeoutMinutes")]
        timeout_minutes: Option<u64>,
    },
}

impl PatternConfig {
    /// Regular expression source text.
    pub fn pattern(&self) -> &str {
        match self {
            Self::Plain(pattern) | Self::Detailed { pattern, .. } => pattern,
        }
    }

    /// Per-pattern cooldown override, if one is configured.
    pub fn cooldown(&self) -> Option<TimeDelta> {
        match self {
            Self::Plain(_) => None,
            Self::Detailed {
                timeout_minutes, ..
            } => timeout_minutes.map(pattern_cooldown),
        }
    }
}

/// Alerting configuration read from the `--config` file.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Chat webhook receiving alert payloads.
    #[serde(rename = "webhookURL")]
    pub webhook_url: String,

    /// Ordered pattern list; earlier entries win ties.
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,

    /// File every scanned line is appended to.
    #[serde(rename = "logFile")]
    pub log_file: PathBuf,

    /// Legacy default cooldown, used when `defaultTimeoutMinutes` is absent.
    #[serde(default, rename = "alertCooldownMinutes")]
    pub alert_cooldown_minutes: Option<u64>,

    /// Default cooldown for patterns without an override.
    #[serde(default, rename = "defaultTimeoutMinutes")]
    pub default_timeout_minutes: Option<u64>,

    /// Upper bound on a single webhook call, in seconds.
    #[serde(default = "default_webhook_timeout_secs", rename = "webhookTimeoutSecs")]
    pub webhook_timeout_secs: u64,
}

impl AlertConfig {
    /// Resolve the process-wide default cooldown.
    ///
    /// `defaultTimeoutMinutes` wins over the legacy `alertCooldownMinutes`.
    /// A default of zero disables the cooldown for patterns without an override.
    pub fn default_cooldown(&self) -> TimeDelta {
        let minutes = self
            .default_timeout_minutes
            .or(self.alert_cooldown_minutes)
            .unwrap_or(0);
        minutes_to_delta(minutes).unwrap_or(NEVER_AGAIN)
    }

    /// Timeout for one webhook delivery.
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// Validate that configuration values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed webhook URL, an empty
    /// log path or a zero webhook timeout, and [`ConfigError::Pattern`] for a
    /// pattern that does not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.webhook_url).map_err(|e| {
            ConfigError::Invalid(format!("webhookURL '{}' is not a URL: {e}", self.webhook_url))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "webhookURL must use http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("logFile must not be empty".to_owned()));
        }
        if self.webhook_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "webhookTimeoutSecs must be >= 1".to_owned(),
            ));
        }
        for entry in &self.patterns {
            regex::Regex::new(entry.pattern()).map_err(|source| ConfigError::Pattern {
                pattern: entry.pattern().to_owned(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Load and validate the alert configuration.
///
/// Files ending in `.toml` are decoded as TOML, everything else as JSON.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_alert_config(path: &Path) -> Result<AlertConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    let config: AlertConfig = if is_toml {
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
    } else {
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}

/// Child process settings taken from the command line.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Working directory the child runs in.
    pub repo_dir: PathBuf,
    /// Executable, resolved against `repo_dir` when relative.
    pub executable: PathBuf,
    /// The child's own YAML configuration, resolved against `repo_dir` when relative.
    pub config_path: PathBuf,
    /// Optional `make` target built before the child is spawned.
    pub build_target: Option<String>,
}

impl ChildSpec {
    /// Absolute-or-repo-relative path of the child's configuration file.
    pub fn resolved_config_path(&self) -> PathBuf {
        self.repo_dir.join(&self.config_path)
    }
}

/// Everything a supervised run needs, fixed at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Alerting settings.
    pub alerts: AlertConfig,
    /// Prefix placed before every alert message and line-log entry.
    pub message_prefix: String,
    /// Child process settings.
    pub child: ChildSpec,
}

/// Map a per-pattern `timeoutMinutes` value to its cooldown.
pub fn pattern_cooldown(minutes: u64) -> TimeDelta {
    if minutes == 0 {
        return NEVER_AGAIN;
    }
    minutes_to_delta(minutes).unwrap_or(NEVER_AGAIN)
}

fn minutes_to_delta(minutes: u64) -> Option<TimeDelta> {
    i64::try_from(minutes).ok().and_then(TimeDelta::try_minutes)
}

fn default_webhook_timeout_secs() -> u64 {
    10
}
