//! `verdict.toml` loading and validation.
//!
//! A loaded [`VerdictConfig`] is immutable and handed to whatever needs it;
//! nothing reads configuration from global state.

use crate::core::confidence::ConfidenceWeightSet;
use crate::core::error::VerdictError;
use crate::core::pipeline;
use crate::core::router::FallbackPolicy;
use crate::core::stage::{ConfidenceSource, ContextSelector, StageSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "verdict.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_backend: u32,
    /// Backend identifiers in preference order.
    #[serde(default)]
    pub backends: Vec<String>,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            max_attempts_per_backend: default_max_attempts(),
            backends: vec!["primary".to_string(), "fallback".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerdictConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    pub stages: Vec<StageSpec>,
    pub confidence: ConfidenceWeightSet,
}

impl Default for VerdictConfig {
    /// Kinetics → adversarial review → literature → arbiter.
    fn default() -> Self {
        let stage = |name: &str,
                     instructions: &str,
                     context: ContextSelector,
                     evidence: &[&str],
                     max_output_units: u32,
                     confidence: ConfidenceSource| StageSpec {
            name: name.to_string(),
            instructions: instructions.to_string(),
            context,
            evidence: evidence.iter().map(|e| e.to_string()).collect(),
            max_output_units,
            confidence,
        };
        Self {
            pipeline: PipelineSection::default(),
            stages: vec![
                stage(
                    "kinetics",
                    "Give only the pharmacokinetic calculation and a dose recommendation.",
                    ContextSelector::None,
                    &["similar_cases"],
                    200,
                    ConfidenceSource::Prior {
                        key: "prob_safe".to_string(),
                    },
                ),
                stage(
                    "adversarial",
                    "Find any reason the previous recommendation could cause harm.",
                    ContextSelector::Previous,
                    &[],
                    250,
                    ConfidenceSource::Absent,
                ),
                stage(
                    "literature",
                    "Summarise recent trial evidence and safer alternatives.",
                    ContextSelector::Stages(vec![
                        "kinetics".to_string(),
                        "adversarial".to_string(),
                    ]),
                    &[],
                    300,
                    ConfidenceSource::Fixed { value: 0.90 },
                ),
                stage(
                    "arbiter",
                    "Weigh the three opinions and give one final recommendation.",
                    ContextSelector::All,
                    &[],
                    300,
                    ConfidenceSource::Derived,
                ),
            ],
            confidence: ConfidenceWeightSet::default(),
        }
    }
}

impl VerdictConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, VerdictError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            VerdictError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, VerdictError> {
        let config: VerdictConfig =
            toml::from_str(raw).map_err(|e| VerdictError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, VerdictError> {
        toml::to_string_pretty(self).map_err(|e| VerdictError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), VerdictError> {
        if self.pipeline.call_timeout_ms == 0 {
            return Err(VerdictError::ConfigError(
                "pipeline.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.pipeline.max_attempts_per_backend == 0 {
            return Err(VerdictError::ConfigError(
                "pipeline.max_attempts_per_backend must be at least 1".to_string(),
            ));
        }
        if self.pipeline.backends.is_empty() {
            return Err(VerdictError::ConfigError(
                "pipeline.backends must list at least one backend".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for backend in &self.pipeline.backends {
            if !seen.insert(backend.as_str()) {
                return Err(VerdictError::ConfigError(format!(
                    "backend '{}' listed twice",
                    backend
                )));
            }
        }
        pipeline::validate_stages(&self.stages)?;
        self.confidence
            .validate_for(&pipeline::scored_stage_names(&self.stages))
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            max_attempts_per_backend: self.pipeline.max_attempts_per_backend,
            call_timeout: Duration::from_millis(self.pipeline.call_timeout_ms),
        }
    }
}
