//! Run configuration: mode defaults, layered overrides and validation.
//!
//! A [`RefinementConfig`] is built exactly once per run through
//! [`RefinementConfig::builder`]: mode defaults first, then
//! [`ConfigOverrides`] (typically loaded from TOML), then explicit setters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{RefineError, Result};
use crate::domain::verdict::DecisionBands;

/// Operating mode of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefinementMode {
    /// A human reviews anything that does not reach the accept threshold.
    SemiAuto,
    /// The engine always returns content, falling back to the best snapshot.
    FullAuto,
}

impl std::str::FromStr for RefinementMode {
    type Err = RefineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semi-auto" | "semi_auto" => Ok(Self::SemiAuto),
            "full-auto" | "full_auto" => Ok(Self::FullAuto),
            other => Err(RefineError::InvalidConfig(format!(
                "unknown refinement mode: {other}"
            ))),
        }
    }
}

/// What to do when the loop stops without meeting the accept threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    Escalate,
    BestEffort,
}

/// Fully resolved configuration for one refinement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub mode: RefinementMode,

    // Derived from mode.
    pub accept_threshold: f64,
    pub good_enough_threshold: f64,
    pub on_max_iterations: OnMaxIterations,
    pub escalation_enabled: bool,

    // Hard limits.
    pub max_iterations: u32,
    pub max_tokens: u64,
    pub timeout_ms: u64,

    // Quality knobs.
    pub regression_tolerance: f64,
    pub section_lock_after_edits: u32,
    pub convergence_threshold: f64,
    pub max_concurrent_patchers: usize,
    pub adjacent_section_gap: usize,
    pub sequential_for_regenerations: bool,
}

impl RefinementConfig {
    /// Mode defaults with no overrides applied.
    pub fn for_mode(mode: RefinementMode) -> Self {
        let (good_enough_threshold, on_max_iterations, escalation_enabled) = match mode {
            RefinementMode::SemiAuto => (0.80, OnMaxIterations::Escalate, true),
            RefinementMode::FullAuto => (0.75, OnMaxIterations::BestEffort, false),
        };
        Self {
            mode,
            accept_threshold: 0.85,
            good_enough_threshold,
            on_max_iterations,
            escalation_enabled,
            max_iterations: 3,
            max_tokens: 50_000,
            timeout_ms: 300_000,
            regression_tolerance: 0.05,
            section_lock_after_edits: 3,
            convergence_threshold: 0.02,
            max_concurrent_patchers: 3,
            adjacent_section_gap: 1,
            sequential_for_regenerations: true,
        }
    }

    pub fn builder(mode: RefinementMode) -> RefinementConfigBuilder {
        RefinementConfigBuilder {
            config: Self::for_mode(mode),
        }
    }

    /// Score bands used by the consensus aggregator.
    pub fn decision_bands(&self) -> DecisionBands {
        DecisionBands::new(self.accept_threshold)
    }

    /// Token count at which a `budget_warning` is emitted.
    pub fn budget_warning_tokens(&self) -> u64 {
        self.max_tokens.saturating_mul(4) / 5
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(RefineError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {v}"
                )))
            }
        };
        unit("accept_threshold", self.accept_threshold)?;
        unit("good_enough_threshold", self.good_enough_threshold)?;
        unit("regression_tolerance", self.regression_tolerance)?;
        unit("convergence_threshold", self.convergence_threshold)?;

        if self.good_enough_threshold > self.accept_threshold {
            return Err(RefineError::InvalidConfig(
                "good_enough_threshold must not exceed accept_threshold".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RefineError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(RefineError::InvalidConfig(
                "max_tokens must be positive".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(RefineError::InvalidConfig(
                "timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_concurrent_patchers == 0 {
            return Err(RefineError::InvalidConfig(
                "max_concurrent_patchers must be at least 1".to_string(),
            ));
        }
        if self.section_lock_after_edits == 0 {
            return Err(RefineError::InvalidConfig(
                "section_lock_after_edits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-run overrides layered on top of mode defaults. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub mode: Option<RefinementMode>,
    pub accept_threshold: Option<f64>,
    pub good_enough_threshold: Option<f64>,
    pub on_max_iterations: Option<OnMaxIterations>,
    pub escalation_enabled: Option<bool>,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub regression_tolerance: Option<f64>,
    pub section_lock_after_edits: Option<u32>,
    pub convergence_threshold: Option<f64>,
    pub max_concurrent_patchers: Option<usize>,
    pub adjacent_section_gap: Option<usize>,
    pub sequential_for_regenerations: Option<bool>,
}

impl ConfigOverrides {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RefineError::InvalidConfig(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// Builder applying defaults, then overrides, then explicit setters.
#[derive(Debug, Clone)]
pub struct RefinementConfigBuilder {
    config: RefinementConfig,
}

impl RefinementConfigBuilder {
    /// Apply layered overrides. A `mode` override re-derives the mode defaults
    /// before the remaining fields are applied.
    pub fn overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(mode) = overrides.mode {
            if mode != self.config.mode {
                self.config = RefinementConfig::for_mode(mode);
            }
        }
        let c = &mut self.config;
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = overrides.$field { c.$field = v; })*
            };
        }
        apply!(
            accept_threshold,
            good_enough_threshold,
            on_max_iterations,
            escalation_enabled,
            max_iterations,
            max_tokens,
            timeout_ms,
            regression_tolerance,
            section_lock_after_edits,
            convergence_threshold,
            max_concurrent_patchers,
            adjacent_section_gap,
            sequential_for_regenerations,
        );
        self
    }

    pub fn accept_threshold(mut self, v: f64) -> Self {
        self.config.accept_threshold = v;
        self
    }

    pub fn good_enough_threshold(mut self, v: f64) -> Self {
        self.config.good_enough_threshold = v;
        self
    }

    pub fn max_iterations(mut self, v: u32) -> Self {
        self.config.max_iterations = v;
        self
    }

    pub fn max_tokens(mut self, v: u64) -> Self {
        self.config.max_tokens = v;
        self
    }

    pub fn timeout_ms(mut self, v: u64) -> Self {
        self.config.timeout_ms = v;
        self
    }

    pub fn regression_tolerance(mut self, v: f64) -> Self {
        self.config.regression_tolerance = v;
        self
    }

    pub fn section_lock_after_edits(mut self, v: u32) -> Self {
        self.config.section_lock_after_edits = v;
        self
    }

    pub fn convergence_threshold(mut self, v: f64) -> Self {
        self.config.convergence_threshold = v;
        self
    }

    pub fn max_concurrent_patchers(mut self, v: usize) -> Self {
        self.config.max_concurrent_patchers = v;
        self
    }

    pub fn adjacent_section_gap(mut self, v: usize) -> Self {
        self.config.adjacent_section_gap = v;
        self
    }

    pub fn sequential_for_regenerations(mut self, v: bool) -> Self {
        self.config.sequential_for_regenerations = v;
        self
    }

    pub fn build(self) -> Result<RefinementConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_defaults_derive_routing() {
        let semi = RefinementConfig::for_mode(RefinementMode::SemiAuto);
        assert_eq!(semi.on_max_iterations, OnMaxIterations::Escalate);
        assert!(semi.escalation_enabled);

        let full = RefinementConfig::for_mode(RefinementMode::FullAuto);
        assert_eq!(full.on_max_iterations, OnMaxIterations::BestEffort);
        assert!(!full.escalation_enabled);
        assert_eq!(full.good_enough_threshold, 0.75);
    }

    #[test]
    fn test_overrides_then_setters() {
        let overrides = ConfigOverrides {
            max_iterations: Some(5),
            convergence_threshold: Some(0.01),
            ..Default::default()
        };
        let config = RefinementConfig::builder(RefinementMode::FullAuto)
            .overrides(&overrides)
            .max_iterations(7)
            .build()
            .unwrap();
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.convergence_threshold, 0.01);
        assert_eq!(config.accept_threshold, 0.85);
    }

    #[test]
    fn test_mode_override_rederives_defaults() {
        let overrides = ConfigOverrides {
            mode: Some(RefinementMode::FullAuto),
            ..Default::default()
        };
        let config = RefinementConfig::builder(RefinementMode::SemiAuto)
            .overrides(&overrides)
            .build()
            .unwrap();
        assert_eq!(config.mode, RefinementMode::FullAuto);
        assert_eq!(config.on_max_iterations, OnMaxIterations::BestEffort);
    }

    #[test]
    fn test_good_enough_above_accept_is_rejected() {
        let err = RefinementConfig::builder(RefinementMode::FullAuto)
            .good_enough_threshold(0.9)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("good_enough_threshold"));
    }

    #[test]
    fn test_zero_patchers_rejected() {
        assert!(RefinementConfig::builder(RefinementMode::SemiAuto)
            .max_concurrent_patchers(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_overrides_parse_from_toml() {
        let raw = r#"
            mode = "full-auto"
            max_iterations = 4
            regression_tolerance = 0.03
            on_max_iterations = "escalate"
        "#;
        let overrides = ConfigOverrides::from_toml_str(raw).unwrap();
        assert_eq!(overrides.mode, Some(RefinementMode::FullAuto));
        assert_eq!(overrides.max_iterations, Some(4));
        assert_eq!(overrides.on_max_iterations, Some(OnMaxIterations::Escalate));
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(ConfigOverrides::from_toml_str("temperature = 0.3").is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(
            "semi-auto".parse::<RefinementMode>().unwrap(),
            RefinementMode::SemiAuto
        );
        assert!("manual".parse::<RefinementMode>().is_err());
    }
}
