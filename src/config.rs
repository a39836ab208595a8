//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default correlation window: one year.
pub const DEFAULT_CORRELATION_WINDOW_DAYS: i64 = 365;

/// Model labels below this confidence are demoted to `other`.
pub const DEFAULT_MIN_MODEL_CONFIDENCE: f32 = 0.55;

/// Minimum confidence for a model company prediction (resolution tier 3).
pub const DEFAULT_COMPANY_CONFIDENCE_FLOOR: f32 = 0.70;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the pattern store JSON document.
    pub patterns_path: PathBuf,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Path to the statistical model artifact. Missing file = classifier unavailable.
    pub model_path: PathBuf,
    /// Messages from a known sender within this many days are follow-ups.
    pub correlation_window_days: i64,
    /// Model-sourced labels below this confidence become `other`.
    pub min_model_confidence: f32,
    /// Company predictions from the model below this confidence are rejected.
    pub company_confidence_floor: f32,
    /// Attach rule ids and tier choices to every decision.
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            patterns_path: PathBuf::from("config/patterns.json"),
            db_path: PathBuf::from("./data/jobmail.db"),
            model_path: PathBuf::from("config/model.json"),
            correlation_window_days: DEFAULT_CORRELATION_WINDOW_DAYS,
            min_model_confidence: DEFAULT_MIN_MODEL_CONFIDENCE,
            company_confidence_floor: DEFAULT_COMPANY_CONFIDENCE_FLOOR,
            debug: false,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let path_var = |name: &str, fallback: PathBuf| {
            std::env::var(name).map(PathBuf::from).unwrap_or(fallback)
        };

        Self {
            patterns_path: path_var("JOBMAIL_PATTERNS", defaults.patterns_path),
            db_path: path_var("JOBMAIL_DB_PATH", defaults.db_path),
            model_path: path_var("JOBMAIL_MODEL_PATH", defaults.model_path),
            correlation_window_days: std::env::var("JOBMAIL_CORRELATION_WINDOW_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|d: &i64| *d > 0)
                .unwrap_or(defaults.correlation_window_days),
            min_model_confidence: std::env::var("JOBMAIL_MIN_MODEL_CONFIDENCE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_model_confidence),
            company_confidence_floor: std::env::var("JOBMAIL_COMPANY_CONFIDENCE_FLOOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.company_confidence_floor),
            debug: std::env::var("JOBMAIL_DEBUG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.debug),
        }
    }

    /// Reject thresholds outside [0, 1].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("min_model_confidence", self.min_model_confidence),
            ("company_confidence_floor", self.company_confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if self.correlation_window_days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "correlation_window_days".into(),
                message: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.correlation_window_days, 365);
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let config = PipelineConfig {
            min_model_confidence: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_window() {
        let config = PipelineConfig {
            correlation_window_days: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
