//! # Pistis - Reliability Testing for LLM-Backed Agents
//!
//! Pistis (Πίστις) is a reliability-testing engine for LLM-backed agents and
//! multi-stage agent pipelines. It answers the questions eyeballing outputs
//! cannot: is the agent *accurate* against a known answer, is it *consistent*
//! across repeated runs, and for pipelines, *which stage* introduces the
//! non-determinism.
//!
//! Testing is deliberately layered and the ordering is enforced as a hard
//! precondition: consistency is meaningless before accuracy, and accuracy is
//! meaningless before retrieval (for retrieval-augmented agents).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pistis_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let storage = create_storage(&StorageKind::Memory)?;
//!     let mut runner = TestRunner::new(storage);
//!
//!     runner.add_ground_truth(
//!         GroundTruth::new("capital-fr", "What is the capital of France?", "Paris")
//!             .with_equivalents(vec!["paris, france".to_string()]),
//!     )?;
//!
//!     let config = TestConfig::default();
//!     runner.skip_retrieval("capital-fr").await?;
//!     let accuracy = runner
//!         .test_accuracy("capital-fr", || async { Ok("Paris".to_string()) }, &config)
//!         .await?;
//!     assert!(accuracy.passed());
//!
//!     let consistency = runner
//!         .test_consistency("capital-fr", || async { Ok("Paris".to_string()) }, &config)
//!         .await?;
//!     assert!(consistency.passed());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **TestRunner**: the layer-enforcement state machine; orchestrates
//!   retrieval -> accuracy -> consistency per ground truth and records every
//!   outcome
//! - **ConsistencyMeasurer**: runs an async operation N times sequentially
//!   and scores output stability; errors and timeouts count as outputs
//! - **PipelineAnalyzer**: localizes the first pipeline step that introduces
//!   excess variance, with the gamma amplification metric
//! - **MetricsStorage**: append-only result persistence with time-windowed
//!   history and degradation detection (in-memory, file, or embedded SQLite)
//!
//! Semantic comparison, agent invocation, and rendering are consumed through
//! narrow interfaces and are out of scope for this crate.

pub mod compare;
pub mod config;
pub mod consistency;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod storage;
pub mod truth;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compare::{ComparisonOutcome, ExactComparator, SemanticComparator};
    pub use crate::config::{
        DEFAULT_TRIAL_TIMEOUT, PistisConfig, RetrievalConfig, TestConfig,
    };
    pub use crate::consistency::{
        ConsistencyMeasurer, ConsistencyResult, MAX_EVIDENCE_EXAMPLES, TrialOutput,
        autodiagnose_variance, has_prompt_variance,
    };
    pub use crate::error::{PistisError, Result};
    pub use crate::pipeline::{
        AgentResult, FailureLocalization, FunctionStep, GammaVerdict, PipelineAnalyzer,
        PipelineStep, gamma, interpret_gamma,
    };
    pub use crate::runner::{
        Evidence, LayerState, RetrievedItem, TestLayer, TestResult, TestRunner, TestStatus,
    };
    pub use crate::storage::{
        DegradationAlert, FileStorage, InMemoryStorage, MetricsStorage, Severity,
        SqliteStorage, StorageKind, create_storage, create_storage_or_fallback,
    };
    pub use crate::truth::{Expected, GroundTruth, GroundTruthMetadata, GroundTruthRegistry};
}
