#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;
use support::Scripted;
use tempfile::tempdir;
use verdict::core::confidence::ValueSource;
use verdict::core::error::VerdictError;
use verdict::core::ledger::AuditLedger;
use verdict::core::pipeline::{CancelToken, FailureKind, Pipeline, RunState};
use verdict::core::router::{FallbackSink, MemoryFallbackSink, ReasonerRouter};
use verdict::core::stage::{ConfidenceSource, ContextSelector, Reasoner, StageExecutor};
use verdict::core::store::Store;

#[test]
fn scenario_weighted_confidence_is_hand_checkable() {
    let run = support::scenario_pipeline().run(&support::case("MRN-1"), &CancelToken::new());
    assert_eq!(run.state, RunState::Complete);
    let expected = 0.30 * 0.85 + 0.20 * 0.85 + 0.50 * 0.90;
    let total = run.final_confidence.expect("final confidence");
    assert!((total - expected).abs() < 1e-12);
    assert!((total - 0.875).abs() < 1e-12);

    let breakdown = run.confidence_breakdown.as_ref().expect("breakdown");
    assert_eq!(breakdown.weights_version, "scenario-1");
    let stages: Vec<&str> = breakdown.terms.iter().map(|t| t.stage.as_str()).collect();
    assert_eq!(stages, vec!["stage1", "stage2", "stage3"]);
    assert_eq!(breakdown.terms[1].source, ValueSource::Baseline);
    assert!(breakdown.is_consistent());

    // the derived stage records the same aggregate on its own step
    let derived = run.steps[3].confidence().expect("derived confidence");
    assert!((derived - 0.875).abs() < 1e-12);
    assert_eq!(run.final_output.as_deref(), Some(run.steps[3].output_payload()));
}

#[test]
fn transitions_follow_the_state_machine() {
    let run = support::scenario_pipeline().run(&support::case("MRN-2"), &CancelToken::new());
    assert_eq!(
        run.transitions,
        vec![
            RunState::Created,
            RunState::Stage(1),
            RunState::Stage(2),
            RunState::Stage(3),
            RunState::Stage(4),
            RunState::Synthesizing,
            RunState::Complete,
        ]
    );
    assert!(run.finished_at.is_some());
}

#[test]
fn stage_inputs_carry_selected_context_only() {
    let run = support::scenario_pipeline().run(&support::case("MRN-3"), &CancelToken::new());
    let [s1, s2, s3, s4] = &run.steps[..] else {
        panic!("expected four steps");
    };
    assert!(s1.input_payload().contains("[evidence:similar_cases]"));
    assert!(!s1.input_payload().contains("[context:"));
    assert!(s2.input_payload().contains(&format!("[context:stage1]\n{}", s1.output_payload())));
    assert!(s3.input_payload().contains("[context:stage1]"));
    assert!(s3.input_payload().contains("[context:stage2]"));
    for name in ["stage1", "stage2", "stage3"] {
        assert!(s4.input_payload().contains(&format!("[context:{}]", name)));
    }
}

#[test]
fn timeout_in_second_stage_yields_verifiable_partial_run() {
    let slow = Scripted::new("model-a").stalling_on("stage2");
    let pipeline = support::pipeline_with(
        vec![Arc::new(slow) as Arc<dyn Reasoner>],
        50,
        Arc::new(MemoryFallbackSink::new()),
    );
    let run = pipeline.run(&support::case("MRN-4"), &CancelToken::new());
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.steps.len(), 1);
    assert!(run.verify().valid);
    assert!(run.final_output.is_none());
    assert!(run.final_confidence.is_none());

    let failure = run.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.stage.as_deref(), Some("stage2"));
    assert_eq!(failure.kind, FailureKind::Reasoner);
    assert!(failure.message.contains("timed out"));
}

#[test]
fn fallback_backend_serves_and_is_recorded_in_ledger() {
    let tmp = tempdir().expect("tempdir");
    let ledger = Arc::new(AuditLedger::open(&Store::open(tmp.path()).unwrap()).unwrap());
    let primary = Scripted::new("primary").failing_on("stage3");
    let backup = Scripted::new("backup");
    let pipeline = support::pipeline_with(
        vec![
            Arc::new(primary) as Arc<dyn Reasoner>,
            Arc::new(backup) as Arc<dyn Reasoner>,
        ],
        2_000,
        Arc::clone(&ledger) as Arc<dyn FallbackSink>,
    );
    let run = pipeline.run(&support::case("MRN-5"), &CancelToken::new());
    assert!(run.is_complete());
    assert_eq!(run.steps[2].model_identifier(), "backup");
    assert_eq!(run.model_identifiers(), vec!["primary", "backup"]);

    let events = ledger.fallback_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stage_name, "stage3");
    assert_eq!(events[0].primary_model, "primary");
    assert_eq!(events[0].fallback_model.as_deref(), Some("backup"));
    assert!(events[0].success);
    assert!(events[0].error_summary.contains("503"));
    assert!(!events[0].error_summary.contains("aaaaaaaaaaaaaaaaaaaaaaaa"));

    let stats = ledger.fallback_statistics().unwrap();
    assert_eq!(stats["primary"].total_fallbacks, 1);
    assert_eq!(stats["primary"].successful_fallbacks, 1);
    // fallbacks stay out of the chained ledger
    assert_eq!(ledger.len().unwrap(), 0);
}

#[test]
fn exhausted_backends_fail_the_run() {
    let sink = Arc::new(MemoryFallbackSink::new());
    let pipeline = support::pipeline_with(
        vec![
            Arc::new(Scripted::new("a").failing_on("stage1")) as Arc<dyn Reasoner>,
            Arc::new(Scripted::new("b").failing_on("stage1")) as Arc<dyn Reasoner>,
        ],
        2_000,
        Arc::clone(&sink) as Arc<dyn FallbackSink>,
    );
    let run = pipeline.run(&support::case("MRN-6"), &CancelToken::new());
    assert_eq!(run.state, RunState::Failed);
    assert!(run.steps.is_empty());
    assert!(run.verify().valid);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
}

#[test]
fn cancellation_stops_at_stage_boundary() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let run = support::scenario_pipeline().run(&support::case("MRN-7"), &cancel);
    assert_eq!(run.state, RunState::Failed);
    assert!(run.steps.is_empty());
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
}

#[test]
fn missing_prior_falls_back_to_baseline_value() {
    let mut case = support::case("MRN-8");
    case.priors.clear();
    let run = support::scenario_pipeline().run(&case, &CancelToken::new());
    assert!(run.is_complete());
    assert_eq!(run.steps[0].confidence(), None);
    let breakdown = run.confidence_breakdown.expect("breakdown");
    assert_eq!(breakdown.terms[0].source, ValueSource::Baseline);
    let expected = 0.30 * 0.85 + 0.20 * 0.85 + 0.50 * 0.90;
    assert!((breakdown.total - expected).abs() < 1e-12);
}

#[test]
fn out_of_range_prior_fails_the_run() {
    let mut case = support::case("MRN-9");
    case.priors.insert("prob_safe".to_string(), 1.4);
    let run = support::scenario_pipeline().run(&case, &CancelToken::new());
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Validation)
    );
}

#[test]
fn batch_runs_are_independent_and_each_verifies() {
    let pipeline = support::scenario_pipeline();
    let cases: Vec<_> = (0..6).map(|i| support::case(&format!("MRN-B{}", i))).collect();
    let runs = pipeline.run_batch(&cases, &CancelToken::new());
    assert_eq!(runs.len(), cases.len());
    for (run, case) in runs.iter().zip(&cases) {
        assert!(run.is_complete());
        assert!(run.verify().valid);
        assert_eq!(run.case_reference, case.case_reference);
    }
    let mut ids: Vec<_> = runs.iter().map(|r| r.run_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), cases.len());
}

#[test]
fn invalid_configurations_are_rejected_at_construction() {
    let executor = || {
        StageExecutor::new(
            ReasonerRouter::new(
                vec![Arc::new(Scripted::new("m")) as Arc<dyn Reasoner>],
                support::policy(1_000),
            )
            .unwrap(),
            Arc::new(MemoryFallbackSink::new()),
        )
    };

    let mut forward = support::scenario_stages();
    forward[1].context = ContextSelector::Stages(vec!["stage3".to_string()]);
    assert!(matches!(
        Pipeline::new(forward, support::scenario_weights(), executor()),
        Err(VerdictError::ConfigError(_))
    ));

    let mut bad_fixed = support::scenario_stages();
    bad_fixed[2].confidence = ConfidenceSource::Fixed { value: 1.1 };
    assert!(Pipeline::new(bad_fixed, support::scenario_weights(), executor()).is_err());

    let mut bad_weights = support::scenario_weights();
    bad_weights.weights.insert("stage1".to_string(), 0.40);
    assert!(Pipeline::new(support::scenario_stages(), bad_weights, executor()).is_err());

    assert!(Pipeline::new(Vec::new(), support::scenario_weights(), executor()).is_err());
}
