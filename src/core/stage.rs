//! Stage executor.
//!
//! Turns one stage specification plus the context it is allowed to see into a
//! sealed [`ChainStep`]. The only side effect is the backend call made through
//! the [`ReasonerRouter`].

use crate::core::canonical;
use crate::core::chain::{ChainStep, StepContent};
use crate::core::error::{ReasonerError, VerdictError};
use crate::core::router::{FallbackSink, ReasonerRouter};
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// An external text-generation capability.
///
/// Implementations block until they have an answer; the router bounds the wait.
pub trait Reasoner: Send + Sync {
    fn model_id(&self) -> &str;
    fn complete(&self, context: &str, max_output_units: u32) -> Result<String, ReasonerError>;
}

/// Which already-produced steps a stage sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSelector {
    #[default]
    None,
    Previous,
    All,
    Stages(Vec<String>),
}

/// Where a stage's confidence comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfidenceSource {
    /// The stage does not score itself.
    #[default]
    Absent,
    Fixed { value: f64 },
    /// Prior probability supplied with the case under `key`.
    Prior { key: String },
    /// Aggregate of the stages before it.
    Derived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Role instructions; opaque to the pipeline.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub context: ContextSelector,
    /// Evidence sources (by name) attached to this stage's input.
    #[serde(default)]
    pub evidence: Vec<String>,
    pub max_output_units: u32,
    #[serde(default)]
    pub confidence: ConfidenceSource,
}

/// Opaque structured context from an evidence provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBlob {
    pub source: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasePayload {
    /// Pseudonymous reference; see [`crate::core::case_ref`].
    pub case_reference: String,
    pub query: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceBlob>,
    #[serde(default)]
    pub priors: BTreeMap<String, f64>,
}

/// Build the literal text a stage is called with.
///
/// Deterministic: evidence is canonically encoded and context steps appear in
/// chain order.
pub fn compose_input(
    stage: &StageSpec,
    case: &CasePayload,
    context: &[&ChainStep],
) -> Result<String, VerdictError> {
    let mut input = String::new();
    let _ = writeln!(input, "[stage] {}", stage.name);
    let _ = writeln!(input, "[instructions]\n{}", stage.instructions);
    let _ = writeln!(input, "[query]\n{}", case.query);
    for source in &stage.evidence {
        let _ = writeln!(input, "[evidence:{}]", source);
        match case.evidence.iter().find(|e| &e.source == source) {
            Some(blob) => {
                let bytes = canonical::encode_value(&blob.content)?;
                let text = String::from_utf8(bytes)
                    .map_err(|e| VerdictError::EncodingError(e.to_string()))?;
                let _ = writeln!(input, "{}", text);
            }
            None => {
                let _ = writeln!(input, "(not supplied)");
            }
        }
    }
    for step in context {
        let _ = writeln!(input, "[context:{}]\n{}", step.stage_name(), step.output_payload());
    }
    Ok(input)
}

pub struct StageExecutor {
    router: ReasonerRouter,
    sink: Arc<dyn FallbackSink>,
}

impl StageExecutor {
    pub fn new(router: ReasonerRouter, sink: Arc<dyn FallbackSink>) -> Self {
        Self { router, sink }
    }

    pub fn router(&self) -> &ReasonerRouter {
        &self.router
    }

    /// Call the backend for `stage` and seal the result onto `prev_hash`.
    pub fn execute(
        &self,
        stage: &StageSpec,
        input_payload: &str,
        prev_hash: &str,
        confidence: Option<f64>,
    ) -> Result<ChainStep, VerdictError> {
        let served = self.router.serve(
            &stage.name,
            input_payload,
            stage.max_output_units,
            self.sink.as_ref(),
        )?;
        let timestamp = time::now_iso8601();
        let step = ChainStep::seal(
            StepContent {
                stage_name: &stage.name,
                input_payload,
                output_payload: &served.text,
                timestamp: &timestamp,
                confidence,
                model_identifier: &served.model_identifier,
            },
            prev_hash,
        )?;
        info!(
            stage = %stage.name,
            model = %served.model_identifier,
            step_hash = %step.step_hash(),
            "stage sealed"
        );
        Ok(step)
    }
}
