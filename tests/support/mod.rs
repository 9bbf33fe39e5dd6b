#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use verdict::core::case_ref;
use verdict::core::confidence::ConfidenceWeightSet;
use verdict::core::error::ReasonerError;
use verdict::core::pipeline::Pipeline;
use verdict::core::router::{FallbackPolicy, FallbackSink, MemoryFallbackSink, ReasonerRouter};
use verdict::core::stage::{
    CasePayload, ConfidenceSource, ContextSelector, EvidenceBlob, Reasoner, StageExecutor,
    StageSpec,
};

/// Deterministic backend that answers per stage and can be told to fail or stall.
pub struct Scripted {
    id: String,
    fail_stages: Vec<String>,
    stall_stages: Vec<String>,
    stall: Duration,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fail_stages: Vec::new(),
            stall_stages: Vec::new(),
            stall: Duration::from_millis(400),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, stage: &str) -> Self {
        self.fail_stages.push(stage.to_string());
        self
    }

    pub fn stalling_on(mut self, stage: &str) -> Self {
        self.stall_stages.push(stage.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn stage_of(context: &str) -> String {
    context
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("[stage] "))
        .unwrap_or("?")
        .to_string()
}

impl Reasoner for Scripted {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn complete(&self, context: &str, _max_output_units: u32) -> Result<String, ReasonerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stage = stage_of(context);
        if self.fail_stages.contains(&stage) {
            return Err(ReasonerError::Backend(format!(
                "503 upstream unavailable (key sk-{})",
                "a".repeat(24)
            )));
        }
        if self.stall_stages.contains(&stage) {
            thread::sleep(self.stall);
        }
        Ok(format!("{} on {}: {} bytes considered", self.id, stage, context.len()))
    }
}

pub fn stage(name: &str, context: ContextSelector, confidence: ConfidenceSource) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        instructions: format!("Act as the {} reviewer.", name),
        context,
        evidence: Vec::new(),
        max_output_units: 128,
        confidence,
    }
}

/// stage1 = 0.85, stage2 unscored, stage3 = 0.90, stage4 derived.
pub fn scenario_stages() -> Vec<StageSpec> {
    vec![
        StageSpec {
            evidence: vec!["similar_cases".to_string()],
            ..stage(
                "stage1",
                ContextSelector::None,
                ConfidenceSource::Prior {
                    key: "prob_safe".to_string(),
                },
            )
        },
        stage("stage2", ContextSelector::Previous, ConfidenceSource::Absent),
        stage(
            "stage3",
            ContextSelector::Stages(vec!["stage1".to_string(), "stage2".to_string()]),
            ConfidenceSource::Fixed { value: 0.90 },
        ),
        stage("stage4", ContextSelector::All, ConfidenceSource::Derived),
    ]
}

pub fn scenario_weights() -> ConfidenceWeightSet {
    let mut weights = BTreeMap::new();
    weights.insert("stage1".to_string(), 0.30);
    weights.insert("stage3".to_string(), 0.50);
    ConfidenceWeightSet {
        version: "scenario-1".to_string(),
        weights,
        baseline_weight: 0.20,
        baseline_value: 0.85,
    }
}

pub fn case(raw_id: &str) -> CasePayload {
    let mut priors = BTreeMap::new();
    priors.insert("prob_safe".to_string(), 0.85);
    CasePayload {
        case_reference: case_ref::pseudonymize(raw_id, "test-salt").expect("pseudonym"),
        query: "Is 5 mg safe for this patient?".to_string(),
        evidence: vec![EvidenceBlob {
            source: "similar_cases".to_string(),
            content: serde_json::json!({"n_cases": 12, "prob_safe": 0.85}),
        }],
        priors,
    }
}

pub fn policy(timeout_ms: u64) -> FallbackPolicy {
    FallbackPolicy {
        max_attempts_per_backend: 1,
        call_timeout: Duration::from_millis(timeout_ms),
    }
}

pub fn pipeline_with(
    backends: Vec<Arc<dyn Reasoner>>,
    timeout_ms: u64,
    sink: Arc<dyn FallbackSink>,
) -> Pipeline {
    let router = ReasonerRouter::new(backends, policy(timeout_ms)).expect("router");
    Pipeline::new(
        scenario_stages(),
        scenario_weights(),
        StageExecutor::new(router, sink),
    )
    .expect("pipeline")
}

pub fn scenario_pipeline() -> Pipeline {
    pipeline_with(
        vec![Arc::new(Scripted::new("model-a")) as Arc<dyn Reasoner>],
        2_000,
        Arc::new(MemoryFallbackSink::new()),
    )
}
