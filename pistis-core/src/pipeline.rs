//! Multi-agent pipeline failure localization
//!
//! Runs the consistency measurer on successive prefixes of a pipeline to find
//! the first step that introduces excess variance. A linear scan, not a
//! binary search: prefix execution cost dominates and pipelines are short.
//!
//! Known limitation: localization stops at the first prefix that drops below
//! threshold, so a second, independently-failing later stage is never
//! reported in the same run.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::TestConfig;
use crate::consistency::{ConsistencyMeasurer, has_prompt_variance};
use crate::error::Result;
use crate::runner::{Evidence, TestLayer, TestResult, TestStatus};
use crate::storage::MetricsStorage;

static DATE_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4}").expect("valid date pattern")
});

/// A named step in an agent pipeline
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Step name, used in diagnosis text and persisted results
    fn name(&self) -> &str;

    /// Execute the step on the previous step's output
    async fn execute(&self, input: &str) -> Result<String>;
}

/// Function-based pipeline step
pub struct FunctionStep<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FunctionStep<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    /// Create a new function step
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> PipelineStep for FunctionStep<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &str) -> Result<String> {
        (self.func)(input)
    }
}

/// Consistency measurement for one pipeline prefix, named after its last step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// Name of the last step in the measured prefix
    pub agent: String,
    /// Consistency of the prefix's end-to-end output
    pub consistency: f64,
    /// Serialized prefix outputs, trial order
    pub outputs: Vec<String>,
}

/// Terminal output of pipeline failure localization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum FailureLocalization {
    /// Every prefix met the consistency threshold
    AllAgentsConsistent {
        /// Per-prefix measurements, pipeline order
        results: Vec<AgentResult>,
        /// Variance-amplification metric over all prefixes
        gamma: Option<f64>,
    },
    /// A prefix dropped below the consistency threshold
    AgentFailing {
        /// First step whose prefix fell below threshold
        failing_agent: String,
        /// Measurements up to and including the failing prefix
        results: Vec<AgentResult>,
        /// Human-readable cause
        diagnosis: String,
        /// Ordered remediation hints
        suggestions: Vec<String>,
        /// Variance-amplification metric over the tested prefixes
        gamma: Option<f64>,
    },
}

impl FailureLocalization {
    /// Name of the failing step, if localization found one
    pub fn failing_agent(&self) -> Option<&str> {
        match self {
            FailureLocalization::AgentFailing { failing_agent, .. } => Some(failing_agent),
            FailureLocalization::AllAgentsConsistent { .. } => None,
        }
    }

    /// Per-prefix measurements
    pub fn results(&self) -> &[AgentResult] {
        match self {
            FailureLocalization::AllAgentsConsistent { results, .. } => results,
            FailureLocalization::AgentFailing { results, .. } => results,
        }
    }

    /// Gamma metric over the tested prefixes
    pub fn gamma(&self) -> Option<f64> {
        match self {
            FailureLocalization::AllAgentsConsistent { gamma, .. } => *gamma,
            FailureLocalization::AgentFailing { gamma, .. } => *gamma,
        }
    }
}

/// Interpretation band for the gamma metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GammaVerdict {
    /// Stages cancel each other's variance (gamma < 0.8)
    Dampening,
    /// Stages are independent (0.8 <= gamma <= 1.2)
    Independent,
    /// Stages compound and amplify variance (gamma > 1.2)
    Amplifying,
}

/// Gamma: end-to-end variance over the sum of per-prefix variances.
///
/// `None` when every tested prefix was perfectly consistent (the denominator
/// is zero, there is no variance to attribute).
pub fn gamma(results: &[AgentResult]) -> Option<f64> {
    let last = results.last()?;
    let total: f64 = results.iter().map(|r| 1.0 - r.consistency).sum();
    if total <= f64::EPSILON {
        return None;
    }
    Some((1.0 - last.consistency) / total)
}

/// Classify a gamma value into its interpretation band
pub fn interpret_gamma(gamma: f64) -> GammaVerdict {
    if gamma < 0.8 {
        GammaVerdict::Dampening
    } else if gamma <= 1.2 {
        GammaVerdict::Independent
    } else {
        GammaVerdict::Amplifying
    }
}

/// Localizes the source of non-determinism in an ordered agent pipeline
pub struct PipelineAnalyzer {
    steps: Vec<Arc<dyn PipelineStep>>,
    storage: Option<Arc<dyn MetricsStorage>>,
}

impl PipelineAnalyzer {
    /// Create an analyzer over an ordered list of steps
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>) -> Self {
        Self {
            steps,
            storage: None,
        }
    }

    /// Persist a pipeline-layer result per measured prefix
    pub fn with_storage(mut self, storage: Arc<dyn MetricsStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Find the first step whose prefix drops below the consistency
    /// threshold.
    ///
    /// Prefix `[0..=i]` is executed end-to-end against the fixed initial
    /// input `config.n_trials` times; a step error inside a prefix becomes
    /// that trial's error-output. First-failure policy: once a prefix fails,
    /// later steps are not tested.
    pub async fn localize_failure(
        &self,
        input: &str,
        config: &TestConfig,
    ) -> Result<FailureLocalization> {
        config.validate()?;

        let measurer = ConsistencyMeasurer::from_config(config);
        let mut results: Vec<AgentResult> = Vec::with_capacity(self.steps.len());

        for i in 0..self.steps.len() {
            let prefix = &self.steps[..=i];
            let name = self.steps[i].name().to_string();

            let measured = measurer
                .measure(move || async move {
                    let mut value = input.to_string();
                    for step in prefix {
                        value = step.execute(&value).await?;
                    }
                    Ok(value)
                })
                .await?;

            tracing::debug!(
                step = %name,
                consistency = measured.consistency,
                unique = measured.unique_count,
                "measured pipeline prefix"
            );

            let agent_result = AgentResult {
                agent: name.clone(),
                consistency: measured.consistency,
                outputs: measured.serialized.clone(),
            };

            if let Some(storage) = &self.storage {
                let status = if measured.consistency >= config.consistency_threshold {
                    TestStatus::Pass
                } else {
                    TestStatus::Fail
                };
                let record = TestResult::new(&name, TestLayer::Pipeline, status)
                    .with_consistency(measured.consistency)
                    .with_evidence(Evidence {
                        outputs: measured.serialized.clone(),
                        unique_count: measured.unique_count,
                        examples: measured.evidence.clone(),
                    });
                storage.save(&record).await?;
            }

            results.push(agent_result);

            if measured.consistency < config.consistency_threshold {
                let previous = if i > 0 {
                    Some(results[i - 1].consistency)
                } else {
                    None
                };
                let diagnosis = self.diagnose(&name, measured.consistency, previous, config);
                let suggestions =
                    self.suggest(&name, &results[i], previous, measured.unique_count);
                let gamma = gamma(&results);

                return Ok(FailureLocalization::AgentFailing {
                    failing_agent: name,
                    results,
                    diagnosis,
                    suggestions,
                    gamma,
                });
            }
        }

        let gamma = gamma(&results);
        Ok(FailureLocalization::AllAgentsConsistent { results, gamma })
    }

    fn diagnose(
        &self,
        name: &str,
        consistency: f64,
        previous: Option<f64>,
        config: &TestConfig,
    ) -> String {
        let mut diagnosis = format!(
            "Pipeline through step '{}' shows {:.1}% output variance \
             (consistency {:.2}, threshold {:.2}).",
            name,
            (1.0 - consistency) * 100.0,
            consistency,
            config.consistency_threshold
        );

        if let Some(previous) = previous {
            // Marginal contribution is a simplification: downstream variance
            // is cumulative across steps, not additive.
            diagnosis.push_str(&format!(
                " Consistency dropped {:.2} versus the previous prefix ({:.2}); \
                 that delta approximates step '{}''s own contribution.",
                previous - consistency,
                previous,
                name
            ));
        }
        diagnosis
    }

    fn suggest(
        &self,
        name: &str,
        result: &AgentResult,
        previous: Option<f64>,
        unique_count: usize,
    ) -> Vec<String> {
        let mut suggestions = Vec::new();

        if has_prompt_variance(&result.outputs) {
            suggestions.push(format!(
                "Output lengths vary widely; the prompt for '{}' may be ambiguous. \
                 Tighten its instructions.",
                name
            ));
        }

        if let Some(previous) = previous {
            if previous - result.consistency > 0.1 {
                suggestions.push(format!(
                    "The pipeline was notably more consistent before '{}'; check \
                     whether the step is redundant or removable.",
                    name
                ));
            }
        }

        let unique_ratio = if result.outputs.is_empty() {
            0.0
        } else {
            unique_count as f64 / result.outputs.len() as f64
        };
        if unique_ratio > 0.7 {
            suggestions.push(
                "Most trials produced distinct outputs; force deterministic sampling \
                 (temperature 0) for this step."
                    .to_string(),
            );
        }

        if result.outputs.iter().any(|o| DATE_LIKE.is_match(o)) {
            suggestions.push(
                "Outputs contain date-like values; time-based data is a common source \
                 of non-determinism. Pin or mock the clock."
                    .to_string(),
            );
        }

        suggestions.push(format!(
            "Isolate '{}' and re-test it alone against the same input.",
            name
        ));
        suggestions.push(
            "Audit the step for non-deterministic inputs: random seeds, external \
             APIs, retrieval ordering."
                .to_string(),
        );

        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn step(
        name: &str,
        func: impl Fn(&str) -> Result<String> + Send + Sync + 'static,
    ) -> Arc<dyn PipelineStep> {
        Arc::new(FunctionStep::new(name, func))
    }

    fn alternating_step(name: &str) -> Arc<dyn PipelineStep> {
        let calls = AtomicUsize::new(0);
        step(name, move |_input| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n % 2 == 0 { "A" } else { "B" }.to_string())
        })
    }

    #[tokio::test]
    async fn test_localizes_the_variant_middle_step() {
        let steps = vec![
            step("ConsistentAgent", |_input| Ok("X".to_string())),
            alternating_step("VariantAgent"),
            step("DeterministicAgent", |input| Ok(input.to_uppercase())),
        ];
        let analyzer = PipelineAnalyzer::new(steps);
        let config = TestConfig::default()
            .with_trials(5)
            .with_consistency_threshold(0.85);

        let localization = analyzer.localize_failure("start", &config).await.unwrap();

        assert_eq!(localization.failing_agent(), Some("VariantAgent"));
        // Step 0 passed, step 1 failed, step 2 never ran
        assert_eq!(localization.results().len(), 2);
        assert_eq!(localization.results()[0].consistency, 1.0);
        match &localization {
            FailureLocalization::AgentFailing {
                diagnosis,
                suggestions,
                ..
            } => {
                assert!(diagnosis.contains("variance"));
                assert!(diagnosis.contains("VariantAgent"));
                assert!(!suggestions.is_empty());
            }
            other => panic!("expected a failing localization, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_failure_policy_stops_at_step_zero() {
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);

        let calls = AtomicUsize::new(0);
        let steps = vec![
            step("FlakyFirst", move |_input| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("v{n}"))
            }),
            step("NeverReached", move |input| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input.to_string())
            }),
        ];
        let analyzer = PipelineAnalyzer::new(steps);
        let config = TestConfig::default().with_consistency_threshold(0.85);

        let localization = analyzer.localize_failure("start", &config).await.unwrap();
        assert_eq!(localization.failing_agent(), Some("FlakyFirst"));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_consistent_pipeline() {
        let steps = vec![
            step("Echo", |input| Ok(input.to_string())),
            step("Upper", |input| Ok(input.to_uppercase())),
        ];
        let analyzer = PipelineAnalyzer::new(steps);

        let localization = analyzer
            .localize_failure("hello", &TestConfig::default())
            .await
            .unwrap();

        assert!(localization.failing_agent().is_none());
        assert_eq!(localization.results().len(), 2);
        // Perfectly consistent prefixes: no variance to attribute
        assert!(localization.gamma().is_none());
    }

    #[tokio::test]
    async fn test_step_errors_become_trial_outputs() {
        let calls = AtomicUsize::new(0);
        let steps = vec![step("SometimesFails", move |_input| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Ok("fine".to_string())
            } else {
                Err(crate::error::PistisError::Agent("upstream 500".to_string()))
            }
        })];
        let analyzer = PipelineAnalyzer::new(steps);
        let config = TestConfig::default().with_consistency_threshold(0.9);

        let localization = analyzer.localize_failure("in", &config).await.unwrap();
        assert_eq!(localization.failing_agent(), Some("SometimesFails"));
        let outputs = &localization.results()[0].outputs;
        assert_eq!(outputs.len(), 5);
        assert!(outputs.iter().any(|o| o.contains("upstream 500")));
    }

    #[tokio::test]
    async fn test_date_like_outputs_are_flagged() {
        let calls = AtomicUsize::new(0);
        let steps = vec![step("Dated", move |_input| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("generated on 2026-08-{:02}", n + 1))
        })];
        let analyzer = PipelineAnalyzer::new(steps);
        let config = TestConfig::default().with_consistency_threshold(0.9);

        let localization = analyzer.localize_failure("in", &config).await.unwrap();
        match localization {
            FailureLocalization::AgentFailing { suggestions, .. } => {
                assert!(suggestions.iter().any(|s| s.contains("date-like")));
            }
            other => panic!("expected a failing localization, got {other:?}"),
        }
    }

    #[test]
    fn test_gamma_math_and_bands() {
        let results = vec![
            AgentResult {
                agent: "a".to_string(),
                consistency: 0.9,
                outputs: vec![],
            },
            AgentResult {
                agent: "b".to_string(),
                consistency: 0.6,
                outputs: vec![],
            },
        ];
        // (1 - 0.6) / ((1 - 0.9) + (1 - 0.6)) = 0.4 / 0.5 = 0.8
        let g = gamma(&results).unwrap();
        assert!((g - 0.8).abs() < 1e-9);
        assert_eq!(interpret_gamma(g), GammaVerdict::Independent);

        assert_eq!(interpret_gamma(0.5), GammaVerdict::Dampening);
        assert_eq!(interpret_gamma(1.5), GammaVerdict::Amplifying);
        assert!(gamma(&[]).is_none());
    }

    #[tokio::test]
    async fn test_results_are_persisted_when_storage_is_attached() {
        use crate::storage::InMemoryStorage;

        let storage = Arc::new(InMemoryStorage::new());
        let steps = vec![step("Echo", |input| Ok(input.to_string()))];
        let analyzer = PipelineAnalyzer::new(steps).with_storage(storage.clone());

        analyzer
            .localize_failure("hello", &TestConfig::default())
            .await
            .unwrap();

        let history = storage.get_history("Echo", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].layer, TestLayer::Pipeline);
        assert_eq!(history[0].status, TestStatus::Pass);
    }
}
