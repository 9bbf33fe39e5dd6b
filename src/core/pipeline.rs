//! Pipeline orchestrator.
//!
//! Runs the configured stages strictly in order. Stage i+1's input contains
//! stage i's output, so there is no parallelism inside a run; independent runs
//! can be batched with [`Pipeline::run_batch`].
//!
//! Every returned [`PipelineRun`], complete or failed, verifies: steps are
//! hashed as they are produced and a failed stage contributes no step.

use crate::core::chain::{self, ChainStep, ChainVerdict};
use crate::core::confidence::{ConfidenceBreakdown, ConfidenceWeightSet};
use crate::core::error::VerdictError;
use crate::core::stage::{
    self, CasePayload, ConfidenceSource, ContextSelector, StageExecutor, StageSpec,
};
use crate::core::time;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use ulid::Ulid;

/// Cooperative cancellation, observed at stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `Created → Stage(1) → … → Stage(n) → Synthesizing → Complete`, any
/// non-terminal state may go to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Stage(usize),
    Synthesizing,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState, stage_count: usize) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, Stage(1)) => stage_count >= 1,
            (Stage(i), Stage(j)) => j == i + 1 && j <= stage_count,
            (Stage(i), Synthesizing) => i == stage_count,
            (Synthesizing, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Reasoner,
    Cancelled,
    Encoding,
    Validation,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    fn from_error(stage: Option<String>, err: &VerdictError) -> Self {
        let kind = match err {
            VerdictError::ReasonerFailure { .. } => FailureKind::Reasoner,
            VerdictError::Cancelled(_) => FailureKind::Cancelled,
            VerdictError::EncodingError(_) => FailureKind::Encoding,
            VerdictError::ValidationError(_) => FailureKind::Validation,
            _ => FailureKind::Other,
        };
        Self {
            stage,
            kind,
            message: err.to_string(),
        }
    }
}

/// One execution of the pipeline for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub case_reference: String,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub steps: Vec<ChainStep>,
    pub final_output: Option<String>,
    pub final_confidence: Option<f64>,
    pub confidence_breakdown: Option<ConfidenceBreakdown>,
    pub weights_version: String,
    pub failure: Option<RunFailure>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl PipelineRun {
    fn start(case_reference: &str, weights_version: &str) -> Self {
        Self {
            run_id: Ulid::new().to_string(),
            case_reference: case_reference.to_string(),
            state: RunState::Created,
            transitions: vec![RunState::Created],
            steps: Vec::new(),
            final_output: None,
            final_confidence: None,
            confidence_breakdown: None,
            weights_version: weights_version.to_string(),
            failure: None,
            started_at: time::now_iso8601(),
            finished_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    pub fn head_hash(&self) -> String {
        chain::head_hash(&self.steps)
    }

    pub fn verify(&self) -> ChainVerdict {
        chain::verify_chain(&self.steps)
    }

    /// Distinct backends that served this run, in first-use order.
    pub fn model_identifiers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.model_identifier().to_string())
            .filter(|m| seen.insert(m.clone()))
            .collect()
    }

    fn transition(&mut self, next: RunState, stage_count: usize) -> Result<(), VerdictError> {
        if !self.state.can_transition_to(next, stage_count) {
            return Err(VerdictError::ValidationError(format!(
                "illegal run transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        self.transitions.push(next);
        Ok(())
    }

    fn fail(&mut self, stage: Option<String>, err: &VerdictError) {
        warn!(run_id = %self.run_id, stage = ?stage, error = %err, "run failed");
        self.failure = Some(RunFailure::from_error(stage, err));
        self.state = RunState::Failed;
        self.transitions.push(RunState::Failed);
        self.finished_at = Some(time::now_iso8601());
    }
}

pub struct Pipeline {
    stages: Vec<StageSpec>,
    weights: ConfidenceWeightSet,
    executor: StageExecutor,
}

impl Pipeline {
    /// Validate the stage list and weights, then bind them to an executor.
    pub fn new(
        stages: Vec<StageSpec>,
        weights: ConfidenceWeightSet,
        executor: StageExecutor,
    ) -> Result<Self, VerdictError> {
        validate_stages(&stages)?;
        weights.validate_for(&scored_stage_names(&stages))?;
        Ok(Self {
            stages,
            weights,
            executor,
        })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn weights(&self) -> &ConfidenceWeightSet {
        &self.weights
    }

    pub fn run(&self, case: &CasePayload, cancel: &CancelToken) -> PipelineRun {
        let mut run = PipelineRun::start(&case.case_reference, &self.weights.version);
        info!(run_id = %run.run_id, stages = self.stages.len(), "run started");
        if let Err(err) = self.drive(&mut run, case, cancel) {
            let stage = match run.state {
                RunState::Stage(i) => self.stages.get(i - 1).map(|s| s.name.clone()),
                _ => None,
            };
            run.fail(stage, &err);
        }
        run
    }

    /// Run independent cases concurrently; each run stays sequential inside.
    pub fn run_batch(&self, cases: &[CasePayload], cancel: &CancelToken) -> Vec<PipelineRun> {
        cases.par_iter().map(|case| self.run(case, cancel)).collect()
    }

    fn drive(
        &self,
        run: &mut PipelineRun,
        case: &CasePayload,
        cancel: &CancelToken,
    ) -> Result<(), VerdictError> {
        let n = self.stages.len();
        for (i, spec) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(VerdictError::Cancelled(format!(
                    "cancelled before stage '{}'",
                    spec.name
                )));
            }
            run.transition(RunState::Stage(i + 1), n)?;
            let confidence = self.resolve_confidence(spec, case, &run.steps)?;
            let context = select_context(&spec.context, &run.steps);
            let input = stage::compose_input(spec, case, &context)?;
            let step = self
                .executor
                .execute(spec, &input, &run.head_hash(), confidence)?;
            run.steps.push(step);
        }

        run.transition(RunState::Synthesizing, n)?;
        let breakdown = self.aggregate(&run.steps)?;
        run.final_output = run.steps.last().map(|s| s.output_payload().to_string());
        run.final_confidence = Some(breakdown.total);
        run.confidence_breakdown = Some(breakdown);
        run.transition(RunState::Complete, n)?;
        run.finished_at = Some(time::now_iso8601());
        info!(
            run_id = %run.run_id,
            head = %run.head_hash(),
            confidence = run.final_confidence.unwrap_or_default(),
            "run complete"
        );
        Ok(())
    }

    fn resolve_confidence(
        &self,
        spec: &StageSpec,
        case: &CasePayload,
        produced: &[ChainStep],
    ) -> Result<Option<f64>, VerdictError> {
        match &spec.confidence {
            ConfidenceSource::Absent => Ok(None),
            ConfidenceSource::Fixed { value } => Ok(Some(*value)),
            ConfidenceSource::Prior { key } => match case.priors.get(key) {
                Some(v) if v.is_finite() && (0.0..=1.0).contains(v) => Ok(Some(*v)),
                Some(v) => Err(VerdictError::ValidationError(format!(
                    "prior '{}' = {} outside [0, 1]",
                    key, v
                ))),
                None => {
                    warn!(stage = %spec.name, key = %key, "prior not supplied, stage is unscored");
                    Ok(None)
                }
            },
            ConfidenceSource::Derived => Ok(Some(self.aggregate(produced)?.total)),
        }
    }

    fn aggregate(&self, steps: &[ChainStep]) -> Result<ConfidenceBreakdown, VerdictError> {
        let reported: Vec<(&str, Option<f64>)> = steps
            .iter()
            .zip(&self.stages)
            .filter(|(_, spec)| spec.confidence != ConfidenceSource::Derived)
            .map(|(step, _)| (step.stage_name(), step.confidence()))
            .collect();
        self.weights.aggregate(&reported)
    }
}

pub fn select_context<'a>(
    selector: &ContextSelector,
    steps: &'a [ChainStep],
) -> Vec<&'a ChainStep> {
    match selector {
        ContextSelector::None => Vec::new(),
        ContextSelector::Previous => steps.last().into_iter().collect(),
        ContextSelector::All => steps.iter().collect(),
        ContextSelector::Stages(names) => steps
            .iter()
            .filter(|s| names.iter().any(|n| n == s.stage_name()))
            .collect(),
    }
}

/// Names of stages that feed the confidence aggregate.
pub fn scored_stage_names(stages: &[StageSpec]) -> Vec<&str> {
    stages
        .iter()
        .filter(|s| s.confidence != ConfidenceSource::Derived)
        .map(|s| s.name.as_str())
        .collect()
}

/// Structural checks on a stage list; all failures are configuration errors.
pub fn validate_stages(stages: &[StageSpec]) -> Result<(), VerdictError> {
    if stages.is_empty() {
        return Err(VerdictError::ConfigError("pipeline has no stages".to_string()));
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, spec) in stages.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(VerdictError::ConfigError(format!("stage {} has no name", i + 1)));
        }
        if spec.max_output_units == 0 {
            return Err(VerdictError::ConfigError(format!(
                "stage '{}' has a zero output budget",
                spec.name
            )));
        }
        if let ContextSelector::Stages(names) = &spec.context {
            for name in names {
                if !seen.contains(name.as_str()) {
                    return Err(VerdictError::ConfigError(format!(
                        "stage '{}' reads '{}', which does not run before it",
                        spec.name, name
                    )));
                }
            }
        }
        match &spec.confidence {
            ConfidenceSource::Fixed { value }
                if !value.is_finite() || !(0.0..=1.0).contains(value) =>
            {
                return Err(VerdictError::ConfigError(format!(
                    "stage '{}' fixed confidence {} outside [0, 1]",
                    spec.name, value
                )));
            }
            ConfidenceSource::Derived if i + 1 != stages.len() => {
                return Err(VerdictError::ConfigError(format!(
                    "stage '{}' derives its confidence but is not the last stage",
                    spec.name
                )));
            }
            _ => {}
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(VerdictError::ConfigError(format!(
                "duplicate stage name '{}'",
                spec.name
            )));
        }
    }
    Ok(())
}
