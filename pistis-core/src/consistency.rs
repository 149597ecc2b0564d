//! Consistency measurement
//!
//! Runs a zero-argument async operation N times sequentially and scores how
//! stable its output is. A trial that errors or times out is captured as a
//! first-class output value: an agent that sometimes throws is itself
//! evidence of inconsistency.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::{DEFAULT_TRIAL_TIMEOUT, TestConfig};
use crate::error::Result;

/// Maximum number of representative examples retained as evidence
pub const MAX_EVIDENCE_EXAMPLES: usize = 5;

/// Output of a single trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrialOutput<T> {
    /// The operation completed and returned a value
    Value(T),
    /// The operation errored or timed out; the message is the output
    Error(String),
}

impl<T: Serialize> TrialOutput<T> {
    /// Canonical string form used for equality, evidence, and diagnosis.
    ///
    /// String values serialize to their raw content; other values serialize
    /// to compact JSON. Map key order is whatever the serializer emits; it is
    /// deliberately not canonicalized (see DESIGN.md).
    pub fn canonical(&self) -> Result<String> {
        match self {
            TrialOutput::Value(v) => match serde_json::to_value(v)? {
                serde_json::Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            },
            TrialOutput::Error(message) => {
                Ok(serde_json::json!({ "error": message }).to_string())
            }
        }
    }

    /// Whether this trial was captured from an error or timeout
    pub fn is_error(&self) -> bool {
        matches!(self, TrialOutput::Error(_))
    }
}

/// Result of one consistency measurement.
///
/// Ephemeral: produced and consumed within a single measurement call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyResult<T> {
    /// Consistency score, `1 - (unique - 1) / max(n_trials, 1)`
    pub consistency: f64,

    /// All trial outputs, in strict trial-execution order
    pub outputs: Vec<TrialOutput<T>>,

    /// Canonical string form of each output, trial order
    pub serialized: Vec<String>,

    /// Number of distinct serialized outputs
    pub unique_count: usize,

    /// Up to 5 distinct serialized examples, first-seen order
    pub evidence: Vec<String>,
}

/// Runs an async operation repeatedly and scores output stability.
///
/// Trials run strictly sequentially: agent calls typically share rate-limited
/// external resources, and evidence selection depends on true trial order.
#[derive(Debug, Clone)]
pub struct ConsistencyMeasurer {
    n_trials: usize,
    timeout: Duration,
}

impl ConsistencyMeasurer {
    /// Create a measurer with the default per-trial timeout
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials: n_trials.max(1),
            timeout: DEFAULT_TRIAL_TIMEOUT,
        }
    }

    /// Create a measurer from a test configuration
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            n_trials: config.n_trials.max(1),
            timeout: config.timeout,
        }
    }

    /// Set the per-trial timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the operation `n_trials` times and measure output consistency.
    ///
    /// Each trial is raced against the per-trial timeout; a timed-out or
    /// erroring trial is recorded as an error-output and measurement
    /// continues. There is no measurement-level timeout beyond
    /// `n_trials * timeout`.
    pub async fn measure<T, F, Fut>(&self, op: F) -> Result<ConsistencyResult<T>>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut outputs = Vec::with_capacity(self.n_trials);
        let mut serialized = Vec::with_capacity(self.n_trials);

        for trial in 0..self.n_trials {
            let output = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => TrialOutput::Value(value),
                Ok(Err(e)) => {
                    tracing::debug!(trial, error = %e, "trial returned an error");
                    TrialOutput::Error(e.to_string())
                }
                Err(_) => {
                    tracing::debug!(trial, timeout_ms = self.timeout.as_millis() as u64, "trial timed out");
                    TrialOutput::Error(format!(
                        "trial timed out after {}ms",
                        self.timeout.as_millis()
                    ))
                }
            };

            serialized.push(output.canonical()?);
            outputs.push(output);
        }

        // First-seen distinct values, order-stable for reproducible evidence
        let mut distinct: Vec<&str> = Vec::new();
        for s in &serialized {
            if !distinct.contains(&s.as_str()) {
                distinct.push(s);
            }
        }

        let unique_count = distinct.len();
        let consistency =
            1.0 - (unique_count as f64 - 1.0) / self.n_trials.max(1) as f64;
        let evidence = distinct
            .iter()
            .take(MAX_EVIDENCE_EXAMPLES)
            .map(|s| s.to_string())
            .collect();

        Ok(ConsistencyResult {
            consistency,
            outputs,
            serialized,
            unique_count,
            evidence,
        })
    }
}

/// Human-readable diagnosis of where measured variance likely comes from.
///
/// A heuristic ladder: checked top to bottom, first match wins.
pub fn autodiagnose_variance<T>(result: &ConsistencyResult<T>) -> String {
    let total = result.outputs.len();

    if result.consistency >= 0.95 {
        return "Outputs are highly consistent across trials.".to_string();
    }

    if total > 1 && result.unique_count == total {
        return "Every trial produced a distinct output; the likely cause is \
                sampling temperature or another source of per-call non-determinism."
            .to_string();
    }

    if result.unique_count == 2 {
        return "Outputs split into exactly two values; the likely cause is \
                conditional or branching logic inside the agent."
            .to_string();
    }

    let normalized = normalized_unique_count(&result.serialized);
    if normalized < result.unique_count {
        return format!(
            "Variance is cosmetic: normalizing whitespace and case collapses {} \
             distinct outputs to {}. The answers agree semantically but differ \
             in formatting.",
            result.unique_count, normalized
        );
    }

    format!(
        "{} of {} trials produced unique outputs ({:.0}%); review the prompt \
         for ambiguity that permits multiple valid phrasings.",
        result.unique_count,
        total,
        result.unique_count as f64 / total.max(1) as f64 * 100.0
    )
}

/// Cheap proxy for prompt-driven variance: flag when output lengths are
/// widely spread (population stddev over mean length > 0.2).
///
/// This is a heuristic, not a content-aware check.
pub fn has_prompt_variance(outputs: &[String]) -> bool {
    if outputs.is_empty() {
        return false;
    }

    let lengths: Vec<f64> = outputs.iter().map(|s| s.len() as f64).collect();
    let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
    if mean == 0.0 {
        return false;
    }

    let variance =
        lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64;
    variance.sqrt() / mean > 0.2
}

fn normalized_unique_count(serialized: &[String]) -> usize {
    let mut distinct: Vec<String> = Vec::new();
    for s in serialized {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if !distinct.contains(&normalized) {
            distinct.push(normalized);
        }
    }
    distinct.len()
}
