//! Engine configuration model
//!
//! Every tunable threshold and weight lives here with its default. The
//! engine loads this structure from layered files and environment variables;
//! tests usually start from `OrchestratorConfig::default()` and tweak one
//! section.
//!
//! # Examples
//!
//! ```rust
//! use overseer_core::config::*;
//!
//! let mut config = OrchestratorConfig::default();
//! config.resolver.chronic_failure_threshold = 2;
//! config.validate().unwrap();
//!
//! assert_eq!(config.router.hop_ceiling, 8);
//! ```

use crate::health::HealthWeights;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub router: RouterConfig,
    pub classifier: ClassifierConfig,
    pub resolver: ResolverConfig,
    pub scoring: ScoringConfig,
    pub health: HealthConfig,
    pub telemetry: TelemetryConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.classifier.validate()?;
        self.resolver.validate()?;
        self.scoring.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// Message routing limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Highest hop count a message may carry
    pub hop_ceiling: u32,
    pub default_ttl_secs: u64,
    /// Entries kept in each of the dead-letter and expired ledgers
    pub ledger_capacity: usize,
    /// Recent message kinds remembered per agent for classification hints
    pub recent_kinds_per_agent: usize,
    /// Span over which the per-project escalation rate is measured
    pub traffic_window_secs: u64,
}

impl RouterConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn traffic_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.traffic_window_secs as i64)
    }

    fn validate(&self) -> Result<()> {
        if self.hop_ceiling == 0 {
            return Err(Error::configuration("router.hop_ceiling must be positive"));
        }
        if self.default_ttl_secs == 0 {
            return Err(Error::configuration("router.default_ttl_secs must be positive"));
        }
        if self.ledger_capacity == 0 {
            return Err(Error::configuration("router.ledger_capacity must be positive"));
        }
        if self.traffic_window_secs == 0 {
            return Err(Error::configuration("router.traffic_window_secs must be positive"));
        }
        Ok(())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            hop_ceiling: 8,
            default_ttl_secs: 300,
            ledger_capacity: 1000,
            recent_kinds_per_agent: 16,
            traffic_window_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Score a rule must exceed to win
    pub threshold: f64,
    /// JSON rule file replacing the built-in rules
    pub rules_path: Option<PathBuf>,
}

impl ClassifierConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(Error::configuration(
                "classifier.threshold must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.15,
            rules_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Failed attempts after which a blocker goes chronic
    pub chronic_failure_threshold: u32,
    /// Bound on every collaborator wait
    pub attempt_timeout_ms: u64,
}

impl ResolverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.chronic_failure_threshold == 0 {
            return Err(Error::configuration(
                "resolver.chronic_failure_threshold must be positive",
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(Error::configuration(
                "resolver.attempt_timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            chronic_failure_threshold: 3,
            attempt_timeout_ms: 5_000,
        }
    }
}

/// Weights of the agent composite score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub completion: f64,
    pub reliability: f64,
    pub collaboration: f64,
    pub velocity: f64,
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.completion + self.reliability + self.collaboration + self.velocity
    }

    fn validate(&self) -> Result<()> {
        let all = [
            self.completion,
            self.reliability,
            self.collaboration,
            self.velocity,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) || self.total() <= 0.0 {
            return Err(Error::configuration(
                "scoring.weights must be non-negative with a positive sum",
            ));
        }
        Ok(())
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            completion: 0.4,
            reliability: 0.3,
            collaboration: 0.2,
            velocity: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub ema_alpha: f64,
    pub initial_completion_rate: f64,
    pub initial_reliability: f64,
    /// Completed tasks per window that count as full velocity
    pub velocity_target: u32,
    pub window_secs: u64,
    /// How long failures keep counting toward strikes
    pub strike_window_secs: u64,
    /// Time a blocked agent waits before one strike decays
    pub strike_cooldown_secs: u64,
    /// Multiplier applied to friction each scoring cycle
    pub friction_decay: f64,
    pub weights: ScoreWeights,
    /// Minimum composite for the MVP commendation
    pub mvp_threshold: f64,
    pub problem_strike_threshold: u8,
}

impl ScoringConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    pub fn strike_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.strike_window_secs as i64)
    }

    pub fn strike_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.strike_cooldown_secs as i64)
    }

    fn validate(&self) -> Result<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(Error::configuration("scoring.ema_alpha must be in (0, 1]"));
        }
        for (name, value) in [
            ("initial_completion_rate", self.initial_completion_rate),
            ("initial_reliability", self.initial_reliability),
            ("friction_decay", self.friction_decay),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::configuration(format!(
                    "scoring.{} must be in [0, 1]",
                    name
                )));
            }
        }
        if self.velocity_target == 0 {
            return Err(Error::configuration("scoring.velocity_target must be positive"));
        }
        if self.window_secs == 0 || self.strike_window_secs == 0 {
            return Err(Error::configuration("scoring windows must be positive"));
        }
        self.weights.validate()
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            initial_completion_rate: 0.5,
            initial_reliability: 0.8,
            velocity_target: 10,
            window_secs: 7 * 24 * 3600,
            strike_window_secs: 7 * 24 * 3600,
            strike_cooldown_secs: 24 * 3600,
            friction_decay: 0.5,
            weights: ScoreWeights::default(),
            mvp_threshold: 75.0,
            problem_strike_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub weights: HealthWeights,
    /// Composite below which an intervention is raised
    pub intervention_floor: f64,
    /// Age past which a chronic blocker raises an intervention
    pub chronic_age_secs: u64,
    pub history_capacity: usize,
}

impl HealthConfig {
    pub fn chronic_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.chronic_age_secs as i64)
    }

    fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if !(0.0..=100.0).contains(&self.intervention_floor) {
            return Err(Error::configuration(
                "health.intervention_floor must be in [0, 100]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(Error::configuration("health.history_capacity must be positive"));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            intervention_floor: 30.0,
            chronic_age_secs: 24 * 3600,
            history_capacity: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resolver.chronic_failure_threshold, 3);
        assert_eq!(config.health.history_capacity, 30);
        assert_eq!(config.classifier.threshold, 0.15);
        assert!((config.scoring.weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = OrchestratorConfig::default();
        config.router.hop_ceiling = 0;
        assert_eq!(config.validate().unwrap_err().category(), "configuration");

        let mut config = OrchestratorConfig::default();
        config.router.traffic_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.scoring.ema_alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.scoring.weights = ScoreWeights {
            completion: 0.0,
            reliability: 0.0,
            collaboration: 0.0,
            velocity: 0.0,
        };
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.health.weights.velocity = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{"resolver": {"chronic_failure_threshold": 5}, "telemetry": {"format": "json"}}"#;
        let config: OrchestratorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.resolver.chronic_failure_threshold, 5);
        assert_eq!(config.resolver.attempt_timeout_ms, 5_000);
        assert_eq!(config.telemetry.format, LogFormat::Json);
        assert_eq!(config.router, RouterConfig::default());
    }
}
