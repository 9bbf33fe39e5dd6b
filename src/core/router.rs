//! Backend routing with an explicit, ordered preference list.
//!
//! The first backend that returns usable output wins. Each time the router moves
//! from a failed backend to the next one, a [`FallbackEvent`] is handed to the
//! configured [`FallbackSink`] before the result is returned, so every
//! substitution is on record.

use crate::core::error::{ReasonerError, VerdictError};
use crate::core::redact;
use crate::core::stage::Reasoner;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One backend substitution. Observability only; not part of any hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub timestamp: String,
    pub stage_name: String,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub error_summary: String,
    pub success: bool,
}

/// Destination for fallback events.
pub trait FallbackSink: Send + Sync {
    fn record(&self, event: &FallbackEvent) -> Result<(), VerdictError>;
}

/// Keeps events in memory; used in-process and in tests.
#[derive(Debug, Default)]
pub struct MemoryFallbackSink {
    events: Mutex<Vec<FallbackEvent>>,
}

impl MemoryFallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FallbackEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl FallbackSink for MemoryFallbackSink {
    fn record(&self, event: &FallbackEvent) -> Result<(), VerdictError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| VerdictError::ValidationError("fallback sink lock poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    /// Attempts against one backend before moving to the next (at least 1).
    pub max_attempts_per_backend: u32,
    /// Caller-supplied bound on a single backend call.
    pub call_timeout: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_backend: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Output of a served call and the backend that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub text: String,
    pub model_identifier: String,
}

pub struct ReasonerRouter {
    backends: Vec<Arc<dyn Reasoner>>,
    policy: FallbackPolicy,
}

impl ReasonerRouter {
    pub fn new(
        backends: Vec<Arc<dyn Reasoner>>,
        policy: FallbackPolicy,
    ) -> Result<Self, VerdictError> {
        if backends.is_empty() {
            return Err(VerdictError::ConfigError(
                "router needs at least one backend".to_string(),
            ));
        }
        if policy.max_attempts_per_backend == 0 {
            return Err(VerdictError::ConfigError(
                "max_attempts_per_backend must be at least 1".to_string(),
            ));
        }
        if policy.call_timeout.is_zero() {
            return Err(VerdictError::ConfigError(
                "call_timeout must be positive".to_string(),
            ));
        }
        Ok(Self { backends, policy })
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn preference(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.model_id().to_string()).collect()
    }

    /// Serve one call, walking the preference list until a backend succeeds.
    pub fn serve(
        &self,
        stage_name: &str,
        context: &str,
        max_output_units: u32,
        sink: &dyn FallbackSink,
    ) -> Result<Served, VerdictError> {
        // (failed model, redacted error) waiting for the next backend's outcome
        let mut pending: Option<(String, String)> = None;
        let mut last_failure: Option<(String, ReasonerError)> = None;

        for backend in &self.backends {
            let model = backend.model_id().to_string();
            let outcome = self.try_backend(backend, stage_name, context, max_output_units);

            if let Some((failed_model, summary)) = pending.take() {
                let event = FallbackEvent {
                    timestamp: time::now_iso8601(),
                    stage_name: stage_name.to_string(),
                    primary_model: failed_model,
                    fallback_model: Some(model.clone()),
                    error_summary: summary,
                    success: outcome.is_ok(),
                };
                warn!(
                    stage = stage_name,
                    primary = %event.primary_model,
                    fallback = %model,
                    success = event.success,
                    "backend substitution"
                );
                sink.record(&event)?;
            }

            match outcome {
                Ok(text) => {
                    return Ok(Served {
                        text,
                        model_identifier: model,
                    });
                }
                Err(err) => {
                    pending = Some((model.clone(), redact::summarize_error(&err.to_string())));
                    last_failure = Some((model, err));
                }
            }
        }

        let (model, err) = last_failure.unwrap_or_else(|| {
            (
                "none".to_string(),
                ReasonerError::Backend("no backend attempted".to_string()),
            )
        });
        Err(VerdictError::ReasonerFailure {
            stage: stage_name.to_string(),
            model,
            reason: redact::summarize_error(&err.to_string()),
        })
    }

    fn try_backend(
        &self,
        backend: &Arc<dyn Reasoner>,
        stage_name: &str,
        context: &str,
        max_output_units: u32,
    ) -> Result<String, ReasonerError> {
        let mut last = ReasonerError::Backend("not attempted".to_string());
        for attempt in 1..=self.policy.max_attempts_per_backend {
            match call_with_timeout(backend, context, max_output_units, self.policy.call_timeout) {
                Ok(text) => return Ok(text),
                Err(err) => {
                    debug!(
                        stage = stage_name,
                        model = backend.model_id(),
                        attempt,
                        error = %err,
                        "backend attempt failed"
                    );
                    last = err;
                }
            }
        }
        Err(last)
    }
}

/// Run one blocking call on a worker thread and wait at most `timeout`.
///
/// A timed-out worker is abandoned; its late result is dropped with the channel.
fn call_with_timeout(
    backend: &Arc<dyn Reasoner>,
    context: &str,
    max_output_units: u32,
    timeout: Duration,
) -> Result<String, ReasonerError> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(backend);
    let context = context.to_string();
    thread::Builder::new()
        .name(format!("reasoner-{}", backend.model_id()))
        .spawn(move || {
            let _ = tx.send(worker.complete(&context, max_output_units));
        })
        .map_err(|e| ReasonerError::Backend(format!("failed to spawn worker: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(text)) if text.trim().is_empty() => Err(ReasonerError::Empty),
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ReasonerError::Timeout(timeout.as_millis() as u64)),
        Err(RecvTimeoutError::Disconnected) => Err(ReasonerError::Backend(
            "worker exited without a result".to_string(),
        )),
    }
}
