//! Configuration: alert thresholds and application settings.
//!
//! Settings resolve in this order:
//! 1. Path given on the command line (`--config`)
//! 2. `COHORT_INDICATORS_CONFIG` environment variable
//! 3. Compiled defaults
//!
//! A missing or unreadable file is an error only when a path was given
//! explicitly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

pub const CONFIG_ENV_VAR: &str = "COHORT_INDICATORS_CONFIG";

/// Hours of teaching a student is expected to attend over one semester.
pub const DEFAULT_EXPECTED_HOURS_PER_STUDENT: f64 = 400.0;

/// Raw threshold values, as written in a configuration file.
///
/// Turned into a [`ConfigAlerte`] through [`ConfigAlerte::new`], which is where
/// validation happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigAlerteSettings {
    #[serde(alias = "moyenne_difficulte")]
    pub difficulty_average: f64,
    #[serde(alias = "moyenne_critique")]
    pub critical_average: f64,
    #[serde(alias = "taux_absenteisme_attention")]
    pub attendance_attention_rate: f64,
    #[serde(alias = "taux_absenteisme_critique")]
    pub attendance_critical_rate: f64,
    #[serde(alias = "baisse_moyenne")]
    pub progression_delta: f64,
    #[serde(alias = "score_decrochage_attention")]
    pub dropout_attention_score: f64,
    #[serde(alias = "score_decrochage_critique")]
    pub dropout_critical_score: f64,
}

impl Default for ConfigAlerteSettings {
    fn default() -> Self {
        Self {
            difficulty_average: 8.0,
            critical_average: 6.0,
            attendance_attention_rate: 0.10,
            attendance_critical_rate: 0.20,
            progression_delta: -2.0,
            dropout_attention_score: 0.5,
            dropout_critical_score: 0.7,
        }
    }
}

/// Validated alert thresholds. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConfigAlerteSettings", into = "ConfigAlerteSettings")]
pub struct ConfigAlerte {
    settings: ConfigAlerteSettings,
}

impl ConfigAlerte {
    pub fn new(settings: ConfigAlerteSettings) -> Result<Self> {
        let s = &settings;
        check_range("difficulty_average", s.difficulty_average, 0.0, 20.0)?;
        check_range("critical_average", s.critical_average, 0.0, 20.0)?;
        check_range("attendance_attention_rate", s.attendance_attention_rate, 0.0, 1.0)?;
        check_range("attendance_critical_rate", s.attendance_critical_rate, 0.0, 1.0)?;
        check_range("dropout_attention_score", s.dropout_attention_score, 0.0, 1.0)?;
        check_range("dropout_critical_score", s.dropout_critical_score, 0.0, 1.0)?;

        if s.critical_average > s.difficulty_average {
            return Err(Error::Config(
                "critical_average must not exceed difficulty_average".to_string(),
            ));
        }
        if s.attendance_attention_rate > s.attendance_critical_rate {
            return Err(Error::Config(
                "attendance_attention_rate must not exceed attendance_critical_rate".to_string(),
            ));
        }
        if s.dropout_attention_score > s.dropout_critical_score {
            return Err(Error::Config(
                "dropout_attention_score must not exceed dropout_critical_score".to_string(),
            ));
        }
        if !s.progression_delta.is_finite() || s.progression_delta >= 0.0 {
            return Err(Error::Config(format!(
                "progression_delta must be a negative drop, got {}",
                s.progression_delta
            )));
        }
        Ok(Self { settings })
    }

    pub fn difficulty_average(&self) -> f64 {
        self.settings.difficulty_average
    }

    pub fn critical_average(&self) -> f64 {
        self.settings.critical_average
    }

    pub fn attendance_attention_rate(&self) -> f64 {
        self.settings.attendance_attention_rate
    }

    pub fn attendance_critical_rate(&self) -> f64 {
        self.settings.attendance_critical_rate
    }

    pub fn progression_delta(&self) -> f64 {
        self.settings.progression_delta
    }

    /// Twice the attention drop.
    pub fn progression_critical_delta(&self) -> f64 {
        self.settings.progression_delta * 2.0
    }

    pub fn dropout_attention_score(&self) -> f64 {
        self.settings.dropout_attention_score
    }

    pub fn dropout_critical_score(&self) -> f64 {
        self.settings.dropout_critical_score
    }

    pub fn settings(&self) -> &ConfigAlerteSettings {
        &self.settings
    }
}

impl Default for ConfigAlerte {
    fn default() -> Self {
        Self {
            settings: ConfigAlerteSettings::default(),
        }
    }
}

impl TryFrom<ConfigAlerteSettings> for ConfigAlerte {
    type Error = Error;

    fn try_from(settings: ConfigAlerteSettings) -> Result<Self> {
        Self::new(settings)
    }
}

impl From<ConfigAlerte> for ConfigAlerteSettings {
    fn from(config: ConfigAlerte) -> Self {
        config.settings
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(Error::Config(format!(
            "{name} must be within [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// Application settings loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Root directory of the file-backed academic source
    pub data_root: PathBuf,
    pub expected_hours_per_student: f64,
    /// Postgres URL of the indicator cache; `DATABASE_URL` wins when set
    pub database_url: Option<String>,
    pub alerts: ConfigAlerte,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            expected_hours_per_student: DEFAULT_EXPECTED_HOURS_PER_STUDENT,
            database_url: None,
            alerts: ConfigAlerte::default(),
        }
    }
}

impl AnalyticsConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AnalyticsConfig = toml::from_str(content)?;
        if !config.expected_hours_per_student.is_finite()
            || config.expected_hours_per_student < 0.0
        {
            return Err(Error::Config(format!(
                "expected_hours_per_student must be non-negative, got {}",
                config.expected_hours_per_student
            )));
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolves the configuration file from the CLI argument or environment,
    /// falling back to defaults when neither names one.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        Ok(config)
    }
}
