//! Ground-truth registration
//!
//! A ground truth is the oracle for a test: the input question, the expected
//! answer, acceptable alternate forms, and per-test metadata. Entries are
//! immutable once registered and owned by the registry for the lifetime of a
//! test session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{PistisError, Result};

/// Expected answer for a ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    /// Plain text answer
    Text(String),
    /// Numeric answer
    Number(f64),
    /// Structured answer (compared in canonical JSON form)
    Structured(serde_json::Value),
}

impl Expected {
    /// Canonical string form used for comparison and diagnosis text
    pub fn canonical(&self) -> String {
        match self {
            Expected::Text(s) => s.clone(),
            Expected::Number(n) => n.to_string(),
            Expected::Structured(v) => v.to_string(),
        }
    }
}

impl From<&str> for Expected {
    fn from(s: &str) -> Self {
        Expected::Text(s.to_string())
    }
}

impl From<String> for Expected {
    fn from(s: String) -> Self {
        Expected::Text(s)
    }
}

impl From<f64> for Expected {
    fn from(n: f64) -> Self {
        Expected::Number(n)
    }
}

impl From<serde_json::Value> for Expected {
    fn from(v: serde_json::Value) -> Self {
        Expected::Structured(v)
    }
}

/// Typed per-test metadata.
///
/// The recognized fields are explicit; anything else goes in the `extra`
/// extension map and is never consulted by the core algorithms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundTruthMetadata {
    /// Pages (or chunk ids) a retrieval stage is expected to surface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_pages: Option<Vec<u32>>,

    /// Provenance of the ground truth (document, dataset, reviewer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Free-form grouping category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Open extension map for caller-defined keys
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A registered (question, expected answer, equivalents, metadata) tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    /// Unique, stable string key
    pub id: String,

    /// Input prompt for the agent under test
    pub question: String,

    /// Expected answer
    pub expected: Expected,

    /// Ordered list of alternate acceptable string forms
    #[serde(default)]
    pub equivalents: Vec<String>,

    /// Per-test metadata
    #[serde(default)]
    pub metadata: GroundTruthMetadata,
}

impl GroundTruth {
    /// Create a new ground truth
    pub fn new(
        id: impl Into<String>,
        question: impl Into<String>,
        expected: impl Into<Expected>,
    ) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            expected: expected.into(),
            equivalents: Vec::new(),
            metadata: GroundTruthMetadata::default(),
        }
    }

    /// Set alternate acceptable answer forms
    pub fn with_equivalents(mut self, equivalents: Vec<String>) -> Self {
        self.equivalents = equivalents;
        self
    }

    /// Set the pages a retrieval stage is expected to surface
    pub fn with_correct_pages(mut self, pages: Vec<u32>) -> Self {
        self.metadata.correct_pages = Some(pages);
        self
    }

    /// Set the provenance of this ground truth
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    /// Set the grouping category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = Some(category.into());
        self
    }

    /// Attach a caller-defined extension entry
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }
}

/// Registry of ground truths for one test session
#[derive(Debug, Default)]
pub struct GroundTruthRegistry {
    truths: HashMap<String, GroundTruth>,
}

impl GroundTruthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ground truth.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already registered;
    /// entries are immutable and cannot be replaced.
    pub fn register(&mut self, truth: GroundTruth) -> Result<()> {
        if self.truths.contains_key(&truth.id) {
            return Err(PistisError::Configuration(format!(
                "Ground truth '{}' is already registered",
                truth.id
            )));
        }
        self.truths.insert(truth.id.clone(), truth);
        Ok(())
    }

    /// Look up a ground truth by id
    pub fn get(&self, id: &str) -> Option<&GroundTruth> {
        self.truths.get(id)
    }

    /// Registered test ids, in no particular order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.truths.keys().map(String::as_str)
    }

    /// Number of registered ground truths
    pub fn len(&self) -> usize {
        self.truths.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.truths.is_empty()
    }
}
