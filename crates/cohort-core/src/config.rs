//! TOML-based runner configuration.
//!
//! Stores deployment settings including:
//! - Attachment store / activity API endpoint and credentials
//! - Ops channel webhook and authorization-form link
//! - Study policy knobs (windows, adherence bounds, group count)
//!
//! Configuration is read from `~/.config/cohort/config.toml` unless a path
//! is given or `COHORT_CONFIG_DIR` overrides the directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{ConfigError, Result};

/// Remote API configuration shared by the store and directory clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Base URL of the study platform, e.g. `https://api.example.org`.
    #[serde(default)]
    pub base_url: String,
    /// Bearer access key for the service identity.
    #[serde(default)]
    pub access_key: String,
    /// Identity that owns shared study documents.
    #[serde(default)]
    pub study_id: String,
}

impl ApiConfig {
    /// Parse and normalize the base URL, with the trailing slash trimmed.
    pub fn validated_base_url(&self) -> Result<String, ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::MissingKey("api.base_url".into()));
        }
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidValue {
            key: "api.base_url".into(),
            message: e.to_string(),
        })?;
        Ok(self.base_url.trim_end_matches('/').to_string())
    }
}

/// Ops-facing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpsConfig {
    /// Webhook for alerts and cycle reports. Absent means log-only.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Link included in incentive authorization reminders.
    #[serde(default)]
    pub auth_form_url: Option<String>,
    /// Address participants can reply to; appended to outreach messages.
    #[serde(default)]
    pub support_email: Option<String>,
}

/// Study policy knobs. Durations are interpreted against the phase-entry
/// timestamps stamped by the phase machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default = "default_dwell_hours")]
    pub new_user_dwell_hours: i64,
    #[serde(default = "default_trial_window_days")]
    pub trial_window_days: i64,
    #[serde(default = "default_length_days")]
    pub length_days: i64,
    /// Hard stop: past this bound completion no longer waits on the ledger.
    #[serde(default = "default_close_days")]
    pub close_days: i64,
    #[serde(default = "default_warn_days")]
    pub inactivity_warn_days: i64,
    #[serde(default = "default_cut_days")]
    pub inactivity_cut_days: i64,
    /// Trailing window without a weekly check-in that discontinues.
    #[serde(default = "default_weekly_gap_days")]
    pub weekly_gap_days: i64,
    /// How long after discontinuation the ledger is still evaluated.
    #[serde(default = "default_tail_days")]
    pub ledger_tail_days: i64,
    /// Minimum passive-data coverage fraction to pass the trial.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Experiment arms for round-robin assignment.
    #[serde(default = "default_group_count")]
    pub group_count: u32,
}

/// Runner configuration.
///
/// Serialized to/from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ops: OpsConfig,
    #[serde(default)]
    pub study: StudyConfig,
}

// Default functions
fn default_dwell_hours() -> i64 {
    2
}
fn default_trial_window_days() -> i64 {
    4
}
fn default_length_days() -> i64 {
    28
}
fn default_close_days() -> i64 {
    32
}
fn default_warn_days() -> i64 {
    3
}
fn default_cut_days() -> i64 {
    5
}
fn default_weekly_gap_days() -> i64 {
    10
}
fn default_tail_days() -> i64 {
    4
}
fn default_quality_threshold() -> f64 {
    0.5
}
fn default_group_count() -> u32 {
    3
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            new_user_dwell_hours: default_dwell_hours(),
            trial_window_days: default_trial_window_days(),
            length_days: default_length_days(),
            close_days: default_close_days(),
            inactivity_warn_days: default_warn_days(),
            inactivity_cut_days: default_cut_days(),
            weekly_gap_days: default_weekly_gap_days(),
            ledger_tail_days: default_tail_days(),
            quality_threshold: default_quality_threshold(),
            group_count: default_group_count(),
        }
    }
}

impl CoreConfig {
    /// Default config path, honoring `COHORT_CONFIG_DIR`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("COHORT_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("config.toml"));
        }
        let base = dirs::config_dir().ok_or(ConfigError::MissingKey(
            "no config directory on this platform".into(),
        ))?;
        Ok(base.join("cohort").join("config.toml"))
    }

    /// Load from an explicit path, or the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::LoadFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let cfg: CoreConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(cfg)
    }

    /// Persist to the given path, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::SaveFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Reject configs that cannot drive the HTTP clients.
    pub fn require_api(&self) -> Result<()> {
        self.api.validated_base_url()?;
        if self.api.access_key.is_empty() {
            return Err(ConfigError::MissingKey("api.access_key".into()).into());
        }
        if self.api.study_id.is_empty() {
            return Err(ConfigError::MissingKey("api.study_id".into()).into());
        }
        Ok(())
    }
}
