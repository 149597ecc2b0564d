//! Three-layer test runner
//!
//! Enforces the testing order retrieval -> accuracy -> consistency as a hard
//! precondition per test id: consistency is meaningless before accuracy, and
//! accuracy is meaningless before retrieval. Calling a layer out of order is
//! an API-misuse error, never a failing test result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::compare::{ComparisonOutcome, ExactComparator, SemanticComparator};
use crate::config::{RetrievalConfig, TestConfig};
use crate::consistency::{ConsistencyMeasurer, autodiagnose_variance};
use crate::error::{PistisError, Result};
use crate::storage::{DegradationAlert, MetricsStorage};
use crate::truth::{GroundTruth, GroundTruthRegistry};

/// Outcome status of a single test call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The layer passed its threshold
    Pass,
    /// The layer failed its threshold
    Fail,
    /// Passed with caveats
    Warn,
}

/// Which layer produced a test result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestLayer {
    /// Retrieval precision check
    Retrieval,
    /// Single-shot accuracy check
    Accuracy,
    /// Repeated-trial consistency check
    Consistency,
    /// Pipeline prefix measurement
    Pipeline,
}

/// Representative raw outputs retained with a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// All raw outputs, serialized, in trial order
    pub outputs: Vec<String>,
    /// Number of distinct serialized outputs
    pub unique_count: usize,
    /// Up to 5 distinct examples, first-seen order
    pub examples: Vec<String>,
}

/// Record of one test call: pass or fail, with diagnosis when failing.
///
/// Immutable once created; persisted append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Unique record id
    pub record_id: Uuid,
    /// Ground-truth id this result belongs to
    pub test_id: String,
    /// Layer that produced this result
    pub layer: TestLayer,
    /// Pass/fail/warn status
    pub status: TestStatus,
    /// Consistency score, when the layer measured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<f64>,
    /// Accuracy (comparator confidence), when the layer measured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Raw-output evidence, when the layer collected any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    /// Human-readable cause, when failing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    /// Ordered remediation hints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Creation time (UTC)
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    /// Create a result stamped with the current time
    pub fn new(test_id: impl Into<String>, layer: TestLayer, status: TestStatus) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            test_id: test_id.into(),
            layer,
            status,
            consistency: None,
            accuracy: None,
            evidence: None,
            diagnosis: None,
            suggestions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the consistency score
    pub fn with_consistency(mut self, consistency: f64) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Set the accuracy score
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Attach evidence
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Attach a diagnosis
    pub fn with_diagnosis(mut self, diagnosis: impl Into<String>) -> Self {
        self.diagnosis = Some(diagnosis.into());
        self
    }

    /// Attach remediation suggestions
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Override the timestamp (history/retention tests and backfills)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this result passed
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

/// An item returned by a retrieval function, identified by page number or
/// chunk id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Page number (or chunk id) of the retrieved item
    pub page: u32,
}

impl From<u32> for RetrievedItem {
    fn from(page: u32) -> Self {
        Self { page }
    }
}

/// Per-test-id layer flags.
///
/// Monotonic: flags only ever flip false -> true within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerState {
    /// Retrieval layer has passed
    pub retrieval: bool,
    /// Accuracy layer has passed
    pub accuracy: bool,
    /// Consistency layer has passed
    pub consistency: bool,
}

/// The layer-enforcement state machine.
///
/// One `TestRunner` owns the ground truths and layer flags for one test
/// session. Callers must serialize calls per test id (single writer per
/// test id); the `&mut self` receivers enforce this within one instance.
pub struct TestRunner {
    truths: GroundTruthRegistry,
    layers: HashMap<String, LayerState>,
    comparator: Option<Arc<dyn SemanticComparator>>,
    storage: Arc<dyn MetricsStorage>,
}

impl TestRunner {
    /// Create a runner backed by the given metrics storage
    pub fn new(storage: Arc<dyn MetricsStorage>) -> Self {
        Self {
            truths: GroundTruthRegistry::new(),
            layers: HashMap::new(),
            comparator: None,
            storage,
        }
    }

    /// Inject a semantic comparator for accuracy testing
    pub fn with_comparator(mut self, comparator: Arc<dyn SemanticComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Register a ground truth. All layer flags start false.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate ids.
    pub fn add_ground_truth(&mut self, truth: GroundTruth) -> Result<()> {
        let id = truth.id.clone();
        self.truths.register(truth)?;
        self.layers.insert(id, LayerState::default());
        Ok(())
    }

    /// Current layer flags for a test id, if registered
    pub fn layer_state(&self, test_id: &str) -> Option<LayerState> {
        self.layers.get(test_id).copied()
    }

    /// Registered ground truth for a test id, if any
    pub fn ground_truth(&self, test_id: &str) -> Option<&GroundTruth> {
        self.truths.get(test_id)
    }

    /// The storage backend this runner persists results to
    pub fn storage(&self) -> Arc<dyn MetricsStorage> {
        Arc::clone(&self.storage)
    }

    /// Test the retrieval layer: does the retriever surface the expected
    /// pages for this ground truth's question?
    ///
    /// Precision is `|retrieved ∩ expected| / max(|retrieved|, 1)` over
    /// deduplicated page sets. Passing flips the `retrieval` flag.
    pub async fn test_retrieval<F, Fut>(
        &mut self,
        test_id: &str,
        retrieve: F,
        config: &RetrievalConfig,
    ) -> Result<TestResult>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<RetrievedItem>>>,
    {
        let truth = self
            .truths
            .get(test_id)
            .ok_or_else(|| PistisError::UnknownTest(test_id.to_string()))?;

        let result = match retrieve(truth.question.clone()).await {
            Ok(items) => {
                let retrieved: BTreeSet<u32> = items.iter().map(|i| i.page).collect();
                let expected: BTreeSet<u32> = truth
                    .metadata
                    .correct_pages
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                let hits = retrieved.intersection(&expected).count();
                let precision = hits as f64 / retrieved.len().max(1) as f64;

                if precision >= config.precision_min {
                    TestResult::new(test_id, TestLayer::Retrieval, TestStatus::Pass)
                        .with_accuracy(precision)
                } else {
                    let expected_pages: Vec<u32> = expected.iter().copied().collect();
                    let found_pages: Vec<u32> = retrieved.iter().copied().collect();
                    TestResult::new(test_id, TestLayer::Retrieval, TestStatus::Fail)
                        .with_accuracy(precision)
                        .with_diagnosis(format!(
                            "Retrieval precision {:.2} is below the required {:.2}: \
                             expected pages {:?}, found pages {:?}.",
                            precision, config.precision_min, expected_pages, found_pages
                        ))
                        .with_suggestions(vec![
                            "Revisit the chunking strategy: answers split across chunk \
                             boundaries rank poorly."
                                .to_string(),
                            "Check that the embedding model fits the document domain."
                                .to_string(),
                            "Tune the retrieval k parameter; too large dilutes precision, \
                             too small misses pages."
                                .to_string(),
                        ])
                }
            }
            Err(e) => TestResult::new(test_id, TestLayer::Retrieval, TestStatus::Fail)
                .with_diagnosis(format!("Retrieval function failed: {}", e)),
        };

        self.record(result, |state| state.retrieval = true).await
    }

    /// Mark the retrieval layer as passed without running a retriever.
    ///
    /// For agents with no retrieval stage; persists a passing retrieval
    /// result so the session history stays complete.
    pub async fn skip_retrieval(&mut self, test_id: &str) -> Result<TestResult> {
        if self.truths.get(test_id).is_none() {
            return Err(PistisError::UnknownTest(test_id.to_string()));
        }

        let result = TestResult::new(test_id, TestLayer::Retrieval, TestStatus::Pass)
            .with_diagnosis("Retrieval skipped: agent has no retrieval stage.");
        self.record(result, |state| state.retrieval = true).await
    }

    /// Test the accuracy layer: one agent call, compared against the ground
    /// truth via the configured comparator (or exact matching).
    ///
    /// # Errors
    ///
    /// Returns [`PistisError::Precondition`] if retrieval has not passed for
    /// this test id; no result is produced or persisted in that case.
    pub async fn test_accuracy<F, Fut>(
        &mut self,
        test_id: &str,
        agent: F,
        config: &TestConfig,
    ) -> Result<TestResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.require_layer(test_id, TestLayer::Accuracy)?;
        config.validate()?;

        let truth = self
            .truths
            .get(test_id)
            .ok_or_else(|| PistisError::UnknownTest(test_id.to_string()))?;
        let expected = truth.expected.canonical();
        let equivalents = truth.equivalents.clone();

        let result = match agent().await {
            Ok(actual) => {
                let outcome = self
                    .compare(&expected, &equivalents, &actual, config)
                    .await?;

                if outcome.matched && outcome.confidence >= config.accuracy_threshold {
                    TestResult::new(test_id, TestLayer::Accuracy, TestStatus::Pass)
                        .with_accuracy(outcome.confidence)
                } else {
                    TestResult::new(test_id, TestLayer::Accuracy, TestStatus::Fail)
                        .with_accuracy(outcome.confidence)
                        .with_diagnosis(format!(
                            "Expected '{}' ({} accepted equivalents), got '{}' \
                             (matched: {}, confidence {:.2}, required {:.2}).",
                            expected,
                            equivalents.len(),
                            actual,
                            outcome.matched,
                            outcome.confidence,
                            config.accuracy_threshold
                        ))
                        .with_suggestions(accuracy_suggestions())
                }
            }
            Err(e) => TestResult::new(test_id, TestLayer::Accuracy, TestStatus::Fail)
                .with_diagnosis(format!("Agent call failed: {}", e))
                .with_suggestions(accuracy_suggestions()),
        };

        self.record(result, |state| state.accuracy = true).await
    }

    /// Test the consistency layer: N agent calls, scored for stability.
    ///
    /// # Errors
    ///
    /// Returns [`PistisError::Precondition`] if accuracy has not passed for
    /// this test id; no result is produced or persisted in that case.
    pub async fn test_consistency<F, Fut>(
        &mut self,
        test_id: &str,
        agent: F,
        config: &TestConfig,
    ) -> Result<TestResult>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.require_layer(test_id, TestLayer::Consistency)?;
        config.validate()?;

        let measurer = ConsistencyMeasurer::from_config(config);
        let measured = measurer.measure(agent).await?;

        let evidence = Evidence {
            outputs: measured.serialized.clone(),
            unique_count: measured.unique_count,
            examples: measured.evidence.clone(),
        };

        let result = if measured.consistency >= config.consistency_threshold {
            TestResult::new(test_id, TestLayer::Consistency, TestStatus::Pass)
                .with_consistency(measured.consistency)
                .with_evidence(evidence)
        } else {
            TestResult::new(test_id, TestLayer::Consistency, TestStatus::Fail)
                .with_consistency(measured.consistency)
                .with_evidence(evidence)
                .with_diagnosis(autodiagnose_variance(&measured))
                .with_suggestions(vec![
                    "Force deterministic sampling (temperature 0) and re-run.".to_string(),
                    "Review the prompt for ambiguity that permits multiple phrasings."
                        .to_string(),
                ])
        };

        self.record(result, |state| state.consistency = true).await
    }

    /// Degradation check for a test id, delegated to the storage backend
    pub async fn degradation(&self, test_id: &str) -> Result<Option<DegradationAlert>> {
        self.storage.detect_degradation(test_id).await
    }

    async fn compare(
        &self,
        expected: &str,
        equivalents: &[String],
        actual: &str,
        config: &TestConfig,
    ) -> Result<ComparisonOutcome> {
        match (&self.comparator, config.semantic_comparison) {
            (Some(comparator), true) => {
                comparator
                    .compare_with_equivalents(expected, equivalents, actual)
                    .await
            }
            _ => {
                ExactComparator
                    .compare_with_equivalents(expected, equivalents, actual)
                    .await
            }
        }
    }

    fn require_layer(&self, test_id: &str, layer: TestLayer) -> Result<()> {
        let state = self
            .layers
            .get(test_id)
            .ok_or_else(|| PistisError::UnknownTest(test_id.to_string()))?;

        let missing = match layer {
            TestLayer::Accuracy if !state.retrieval => Some(("retrieval", "test_retrieval")),
            TestLayer::Consistency if !state.accuracy => Some(("accuracy", "test_accuracy")),
            _ => None,
        };

        if let Some((missing, required_call)) = missing {
            return Err(PistisError::Precondition {
                test_id: test_id.to_string(),
                missing: missing.to_string(),
                required_call: required_call.to_string(),
            });
        }
        Ok(())
    }

    /// Persist the result, then flip the layer flag on pass.
    ///
    /// Flags are monotonic; `advance` only ever sets a flag to true.
    async fn record(
        &mut self,
        result: TestResult,
        advance: impl FnOnce(&mut LayerState),
    ) -> Result<TestResult> {
        self.storage.save(&result).await?;

        if result.passed() {
            if let Some(state) = self.layers.get_mut(&result.test_id) {
                advance(state);
            }
        }
        Ok(result)
    }
}

fn accuracy_suggestions() -> Vec<String> {
    vec![
        "Clarify the prompt: state the expected answer format explicitly.".to_string(),
        "Verify the context handed to the agent actually contains the answer.".to_string(),
        "Add output-format instructions (e.g. 'answer with a single word').".to_string(),
        "If the answer is acceptable, register it as an equivalent.".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;

    fn runner() -> TestRunner {
        TestRunner::new(Arc::new(InMemoryStorage::new()))
    }

    fn pages(ps: &[u32]) -> Vec<RetrievedItem> {
        ps.iter().copied().map(RetrievedItem::from).collect()
    }

    fn truth() -> GroundTruth {
        GroundTruth::new("capital-fr", "What is the capital of France?", "Paris")
            .with_equivalents(vec!["paris, france".to_string()])
            .with_correct_pages(vec![1, 2])
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        assert!(runner.add_ground_truth(truth()).is_err());
    }

    #[tokio::test]
    async fn test_retrieval_precision_pass_and_fail() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();

        // 2 of 2 retrieved pages expected: precision 1.0
        let result = runner
            .test_retrieval(
                "capital-fr",
                |_q| async { Ok(pages(&[1, 2])) },
                &RetrievalConfig::new(0.7),
            )
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Pass);
        assert!(runner.layer_state("capital-fr").unwrap().retrieval);

        // A second ground truth where precision falls short
        runner
            .add_ground_truth(
                GroundTruth::new("t2", "q", "a").with_correct_pages(vec![7]),
            )
            .unwrap();
        let result = runner
            .test_retrieval(
                "t2",
                |_q| async { Ok(pages(&[1, 2, 7, 9])) },
                &RetrievalConfig::new(0.7),
            )
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Fail);
        let diagnosis = result.diagnosis.unwrap();
        assert!(diagnosis.contains("0.25"));
        assert!(diagnosis.contains("[7]"));
        assert!(!result.suggestions.is_empty());
        assert!(!runner.layer_state("t2").unwrap().retrieval);
    }

    #[tokio::test]
    async fn test_accuracy_requires_retrieval() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();

        let err = runner
            .test_accuracy(
                "capital-fr",
                || async { Ok("Paris".to_string()) },
                &TestConfig::default(),
            )
            .await
            .unwrap_err();

        match err {
            PistisError::Precondition {
                missing,
                required_call,
                ..
            } => {
                assert_eq!(missing, "retrieval");
                assert_eq!(required_call, "test_retrieval");
            }
            other => panic!("expected precondition error, got {other}"),
        }

        // Nothing was persisted for the refused call
        let history = runner.storage().get_history("capital-fr", 1).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_consistency_requires_accuracy() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();

        let err = runner
            .test_consistency(
                "capital-fr",
                || async { Ok("Paris".to_string()) },
                &TestConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PistisError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_id_is_an_error() {
        let mut runner = runner();
        let err = runner.skip_retrieval("missing").await.unwrap_err();
        assert!(matches!(err, PistisError::UnknownTest(_)));
    }

    #[tokio::test]
    async fn test_full_layer_progression() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        let config = TestConfig::default();

        runner.skip_retrieval("capital-fr").await.unwrap();

        let result = runner
            .test_accuracy("capital-fr", || async { Ok("  PARIS ".to_string()) }, &config)
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Pass);

        let result = runner
            .test_consistency("capital-fr", || async { Ok("Paris".to_string()) }, &config)
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.consistency, Some(1.0));

        let state = runner.layer_state("capital-fr").unwrap();
        assert!(state.retrieval && state.accuracy && state.consistency);

        // One persisted record per completed call
        let history = runner.storage().get_history("capital-fr", 1).await.unwrap();
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_accuracy_failure_names_values() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();

        let result = runner
            .test_accuracy(
                "capital-fr",
                || async { Ok("London".to_string()) },
                &TestConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, TestStatus::Fail);
        let diagnosis = result.diagnosis.unwrap();
        assert!(diagnosis.contains("Paris"));
        assert!(diagnosis.contains("London"));
        assert!(
            result
                .suggestions
                .iter()
                .any(|s| s.contains("equivalent"))
        );
        assert!(!runner.layer_state("capital-fr").unwrap().accuracy);
    }

    #[tokio::test]
    async fn test_equivalents_match_through_fallback_comparator() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();

        let result = runner
            .test_accuracy(
                "capital-fr",
                || async { Ok("Paris, France".to_string()) },
                &TestConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Pass);
    }

    struct LenientComparator;

    #[async_trait]
    impl SemanticComparator for LenientComparator {
        async fn compare_with_equivalents(
            &self,
            expected: &str,
            _equivalents: &[String],
            actual: &str,
        ) -> Result<ComparisonOutcome> {
            Ok(ComparisonOutcome {
                matched: actual.to_lowercase().contains(&expected.to_lowercase()),
                confidence: 0.9,
            })
        }

        fn name(&self) -> &str {
            "lenient"
        }
    }

    #[tokio::test]
    async fn test_injected_comparator_is_used() {
        let mut runner =
            TestRunner::new(Arc::new(InMemoryStorage::new()))
                .with_comparator(Arc::new(LenientComparator));
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();

        let result = runner
            .test_accuracy(
                "capital-fr",
                || async { Ok("The capital is Paris.".to_string()) },
                &TestConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.accuracy, Some(0.9));
    }

    #[tokio::test]
    async fn test_agent_error_is_a_failing_outcome_not_an_error() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();

        let result = runner
            .test_accuracy(
                "capital-fr",
                || async { Err(PistisError::Agent("rate limited".to_string())) },
                &TestConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.diagnosis.unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_consistency_failure_carries_evidence() {
        let mut runner = runner();
        runner.add_ground_truth(truth()).unwrap();
        runner.skip_retrieval("capital-fr").await.unwrap();
        let config = TestConfig::default();
        runner
            .test_accuracy("capital-fr", || async { Ok("Paris".to_string()) }, &config)
            .await
            .unwrap();

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result = runner
            .test_consistency(
                "capital-fr",
                || {
                    let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async move { Ok(format!("answer variant {n}")) }
                },
                &config,
            )
            .await
            .unwrap();

        assert_eq!(result.status, TestStatus::Fail);
        let evidence = result.evidence.unwrap();
        assert_eq!(evidence.outputs.len(), 5);
        assert_eq!(evidence.unique_count, 5);
        assert_eq!(evidence.examples.len(), 5);
        assert!(result.diagnosis.is_some());
    }
}
