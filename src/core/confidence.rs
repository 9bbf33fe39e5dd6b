//! Confidence aggregation.
//!
//! A plain weighted sum so a reviewer can recompute the final score by hand from
//! an exported chain: each scored stage contributes `weight × value`, where the
//! value is the stage's own confidence or the configured baseline value, and the
//! weight is the stage's configured weight or the baseline weight.

use crate::core::error::VerdictError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allowed drift of the weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Versioned, process-wide weights; validated once at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeightSet {
    pub version: String,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Weight of a scored stage that has no entry in `weights`.
    pub baseline_weight: f64,
    /// Value used for a scored stage that reported no confidence.
    pub baseline_value: f64,
}

impl Default for ConfidenceWeightSet {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert("kinetics".to_string(), 0.30);
        weights.insert("literature".to_string(), 0.50);
        Self {
            version: "default-1".to_string(),
            weights,
            baseline_weight: 0.20,
            baseline_value: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Reported,
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceTerm {
    pub stage: String,
    pub weight: f64,
    pub value: f64,
    pub source: ValueSource,
}

/// The final score together with every term that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub weights_version: String,
    pub terms: Vec<ConfidenceTerm>,
    pub total: f64,
}

impl ConfidenceBreakdown {
    pub fn recompute(&self) -> f64 {
        self.terms.iter().map(|t| t.weight * t.value).sum()
    }

    pub fn is_consistent(&self) -> bool {
        (self.recompute().clamp(0.0, 1.0) - self.total).abs() <= WEIGHT_SUM_TOLERANCE
    }
}

impl ConfidenceWeightSet {
    pub fn weight_for(&self, stage: &str) -> f64 {
        self.weights
            .get(stage)
            .copied()
            .unwrap_or(self.baseline_weight)
    }

    /// Check the set against the stages that will be scored.
    ///
    /// Fails on unknown stage names, negative or non-finite weights, a baseline
    /// value outside `[0, 1]`, or an effective weight sum that is not 1.0.
    pub fn validate_for(&self, scored_stages: &[&str]) -> Result<(), VerdictError> {
        if self.version.trim().is_empty() {
            return Err(VerdictError::ConfigError(
                "confidence weight set has no version".to_string(),
            ));
        }
        if !self.baseline_value.is_finite() || !(0.0..=1.0).contains(&self.baseline_value) {
            return Err(VerdictError::ConfigError(format!(
                "baseline_value {} outside [0, 1]",
                self.baseline_value
            )));
        }
        check_weight("baseline_weight", self.baseline_weight)?;
        for (stage, weight) in &self.weights {
            check_weight(stage, *weight)?;
            if !scored_stages.contains(&stage.as_str()) {
                return Err(VerdictError::ConfigError(format!(
                    "weight given for unknown or unscored stage '{}'",
                    stage
                )));
            }
        }
        if scored_stages.is_empty() {
            return Err(VerdictError::ConfigError(
                "no scored stages to aggregate".to_string(),
            ));
        }
        let sum: f64 = scored_stages.iter().map(|s| self.weight_for(s)).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(VerdictError::ConfigError(format!(
                "weights for {:?} sum to {}, expected 1.0",
                scored_stages, sum
            )));
        }
        Ok(())
    }

    /// `Σ weight_i × value_i` over the scored stages, in order.
    pub fn aggregate(
        &self,
        reported: &[(&str, Option<f64>)],
    ) -> Result<ConfidenceBreakdown, VerdictError> {
        let mut terms = Vec::with_capacity(reported.len());
        for (stage, confidence) in reported {
            let (value, source) = match confidence {
                Some(v) => {
                    if !v.is_finite() || !(0.0..=1.0).contains(v) {
                        return Err(VerdictError::ValidationError(format!(
                            "stage '{}' reported confidence {} outside [0, 1]",
                            stage, v
                        )));
                    }
                    (*v, ValueSource::Reported)
                }
                None => (self.baseline_value, ValueSource::Baseline),
            };
            terms.push(ConfidenceTerm {
                stage: stage.to_string(),
                weight: self.weight_for(stage),
                value,
                source,
            });
        }
        let total: f64 = terms.iter().map(|t| t.weight * t.value).sum();
        Ok(ConfidenceBreakdown {
            weights_version: self.version.clone(),
            terms,
            total: total.clamp(0.0, 1.0),
        })
    }
}

fn check_weight(name: &str, weight: f64) -> Result<(), VerdictError> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(VerdictError::ConfigError(format!(
            "weight for '{}' must be a finite non-negative number, got {}",
            name, weight
        )));
    }
    Ok(())
}
