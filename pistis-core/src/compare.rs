//! Semantic comparison capability
//!
//! Accuracy testing consumes a comparator through this seam; the engine never
//! implements semantic similarity itself. When no comparator is configured,
//! the runner falls back to [`ExactComparator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of comparing an actual output against an expected answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    /// Whether the actual output is an acceptable answer
    pub matched: bool,
    /// Comparator confidence in the verdict (0.0 to 1.0)
    pub confidence: f64,
}

impl ComparisonOutcome {
    /// A full-confidence match
    pub fn matched() -> Self {
        Self {
            matched: true,
            confidence: 1.0,
        }
    }

    /// A full-confidence mismatch
    pub fn mismatched() -> Self {
        Self {
            matched: false,
            confidence: 1.0,
        }
    }
}

/// Trait for comparing agent output against an expected answer and its
/// acceptable equivalents
#[async_trait]
pub trait SemanticComparator: Send + Sync {
    /// Compare `actual` against `expected` and each entry of `equivalents`
    async fn compare_with_equivalents(
        &self,
        expected: &str,
        equivalents: &[String],
        actual: &str,
    ) -> Result<ComparisonOutcome>;

    /// Get comparator name
    fn name(&self) -> &str;
}

/// Exact comparator: case-insensitive, trimmed string equality.
///
/// The default when no semantic comparator is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparator;

impl ExactComparator {
    fn normalize(s: &str) -> String {
        s.trim().to_lowercase()
    }
}

#[async_trait]
impl SemanticComparator for ExactComparator {
    async fn compare_with_equivalents(
        &self,
        expected: &str,
        equivalents: &[String],
        actual: &str,
    ) -> Result<ComparisonOutcome> {
        let actual = Self::normalize(actual);
        let matched = Self::normalize(expected) == actual
            || equivalents.iter().any(|e| Self::normalize(e) == actual);

        Ok(if matched {
            ComparisonOutcome::matched()
        } else {
            ComparisonOutcome::mismatched()
        })
    }

    fn name(&self) -> &str {
        "exact"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_match_ignores_case_and_whitespace() {
        let comparator = ExactComparator;
        let outcome = comparator
            .compare_with_equivalents("Paris", &[], "  paris \n")
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_equivalents_are_checked_in_order() {
        let comparator = ExactComparator;
        let equivalents = vec!["the city of light".to_string(), "paris, france".to_string()];
        let outcome = comparator
            .compare_with_equivalents("Paris", &equivalents, "Paris, France")
            .await
            .unwrap();
        assert!(outcome.matched);
    }

    #[tokio::test]
    async fn test_mismatch() {
        let comparator = ExactComparator;
        let outcome = comparator
            .compare_with_equivalents("Paris", &[], "London")
            .await
            .unwrap();
        assert!(!outcome.matched);
    }
}
