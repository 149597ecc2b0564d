//! End-to-end reliability session example
//!
//! Runs the three test layers against a scripted agent, then localizes the
//! variant stage of a small pipeline. No real LLM needed - the agents here
//! are plain closures.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pistis_core::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pistis_core=debug")),
        )
        .init();

    println!("Pistis Reliability Session");
    println!("==========================\n");

    let storage = create_storage(&StorageKind::Memory)?;
    let mut runner = TestRunner::new(Arc::clone(&storage));
    let config = TestConfig::default();

    runner.add_ground_truth(
        GroundTruth::new("einstein-birth", "In which year was Einstein born?", "1879")
            .with_equivalents(vec!["in 1879".to_string()])
            .with_correct_pages(vec![12, 13])
            .with_source("biography.pdf"),
    )?;
    println!("✓ Registered ground truth 'einstein-birth'\n");

    // Layer 1: retrieval precision
    let retrieval = runner
        .test_retrieval(
            "einstein-birth",
            |_question| async {
                Ok(vec![
                    RetrievedItem::from(12),
                    RetrievedItem::from(13),
                    RetrievedItem::from(40),
                ])
            },
            &RetrievalConfig::new(0.5),
        )
        .await?;
    println!(
        "✓ Retrieval: {:?} (precision {:?})",
        retrieval.status, retrieval.accuracy
    );

    // Layer 2: single-shot accuracy
    let accuracy = runner
        .test_accuracy("einstein-birth", || async { Ok("1879".to_string()) }, &config)
        .await?;
    println!("✓ Accuracy: {:?}", accuracy.status);

    // Layer 3: consistency over an agent that flips between two phrasings.
    // A strict threshold so the alternation registers as a failure.
    let calls = AtomicUsize::new(0);
    let consistency = runner
        .test_consistency(
            "einstein-birth",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n % 2 == 0 { "1879" } else { "in 1879" }.to_string()) }
            },
            &config.clone().with_consistency_threshold(0.9),
        )
        .await?;
    println!(
        "✓ Consistency: {:?} (score {:?})",
        consistency.status, consistency.consistency
    );
    if let Some(diagnosis) = &consistency.diagnosis {
        println!("  Diagnosis: {diagnosis}");
    }
    for suggestion in &consistency.suggestions {
        println!("  • {suggestion}");
    }

    // Pipeline localization: the middle step introduces the variance
    println!("\nLocalizing a flaky pipeline stage...");
    let rephrase_calls = AtomicUsize::new(0);
    let steps: Vec<Arc<dyn PipelineStep>> = vec![
        Arc::new(FunctionStep::new("summarize", |input: &str| {
            Ok(format!("summary of {input}"))
        })),
        Arc::new(FunctionStep::new("rephrase", move |_input: &str| {
            let n = rephrase_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("variant {n}"))
        })),
        Arc::new(FunctionStep::new("format", |input: &str| {
            Ok(input.to_uppercase())
        })),
    ];

    let analyzer = PipelineAnalyzer::new(steps).with_storage(storage);
    let localization = analyzer.localize_failure("source text", &config).await?;

    match &localization {
        FailureLocalization::AgentFailing {
            failing_agent,
            diagnosis,
            ..
        } => {
            println!("✓ Failing stage: {failing_agent}");
            println!("  Diagnosis: {diagnosis}");
        }
        FailureLocalization::AllAgentsConsistent { .. } => {
            println!("✓ Every stage met the consistency threshold");
        }
    }
    if let Some(g) = localization.gamma() {
        println!("  Gamma: {g:.2} ({:?})", interpret_gamma(g));
    }

    Ok(())
}
