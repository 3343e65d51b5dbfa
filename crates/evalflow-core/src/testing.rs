//! Test doubles and assertion helpers for pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::chat::{self, ChatClient, ChatResponse};
use crate::scoring::{self, RawScores, ScoringService};
use evalflow_store::{DetailRecord, Page, ResultsStore, StoreError, SummaryRecord};
use evalflow_types::{AggregatedSummary, PartialResult};

/// Chat double that answers every question with `"echo: <question>"`.
pub fn echo_chat() -> Arc<dyn ChatClient> {
    chat::from_async_fn(|req| {
        let answer = format!("echo: {}", req.question);
        async move { Ok(ChatResponse::new(answer)) }
    })
}

/// Chat double that always errors.
pub fn failing_chat(message: &'static str) -> Arc<dyn ChatClient> {
    chat::from_async_fn(move |_| async move { Err::<ChatResponse, _>(anyhow::anyhow!(message)) })
}

/// Scoring double that returns `value` for every requested metric.
pub fn constant_scoring(value: f64) -> Arc<dyn ScoringService> {
    scoring::from_async_fn(move |req| {
        let scores: RawScores = req
            .metrics
            .iter()
            .map(|m| (m.name().to_string(), Some(value)))
            .collect();
        async move { Ok(scores) }
    })
}

/// Scoring double that always errors.
pub fn failing_scoring(message: &'static str) -> Arc<dyn ScoringService> {
    scoring::from_async_fn(move |_| async move { Err::<RawScores, _>(anyhow::anyhow!(message)) })
}

/// Wraps a store and fails operations on keys containing any of
/// `patterns`.
pub struct FlakyArtifactStore {
    inner: Arc<dyn ArtifactStore>,
    patterns: Vec<String>,
    /// `None` fails every operation. `Some(n)` fails only the next `n`
    /// matching puts.
    put_failures: Option<AtomicUsize>,
}

impl FlakyArtifactStore {
    pub fn new(inner: Arc<dyn ArtifactStore>, patterns: Vec<String>) -> Self {
        Self {
            inner,
            patterns,
            put_failures: None,
        }
    }

    /// Fail the first `times` puts to matching keys, then recover.
    pub fn failing_puts(inner: Arc<dyn ArtifactStore>, patterns: Vec<String>, times: usize) -> Self {
        Self {
            inner,
            patterns,
            put_failures: Some(AtomicUsize::new(times)),
        }
    }

    fn check(&self, key: &str, is_put: bool) -> Result<(), ArtifactError> {
        let Some(pattern) = self.patterns.iter().find(|p| key.contains(p.as_str())) else {
            return Ok(());
        };
        let fail = match &self.put_failures {
            None => true,
            Some(remaining) => {
                is_put
                    && remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
            }
        };
        if fail {
            return Err(ArtifactError::Backend(format!("injected failure on {pattern}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        self.check(key, false)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError> {
        self.check(key, true)?;
        self.inner.put(key, bytes).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        self.check(prefix, false)?;
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.check(key, false)?;
        self.inner.delete(key).await
    }
}

/// Results store whose writes always fail. Reads see an empty store.
pub struct FailingResultsStore {
    reason: String,
}

impl FailingResultsStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ResultsStore for FailingResultsStore {
    async fn upsert_evaluation(&self, _: &SummaryRecord, _: &[DetailRecord]) -> Result<(), StoreError> {
        Err(StoreError::Join(self.reason.clone()))
    }

    async fn get_summary(&self, _: &str) -> Result<Option<SummaryRecord>, StoreError> {
        Ok(None)
    }

    async fn list_summaries(&self, _: usize, _: Option<&str>) -> Result<Page<SummaryRecord>, StoreError> {
        Ok(Page {
            items: Vec::new(),
            next_token: None,
        })
    }

    async fn list_results(
        &self,
        _: &str,
        _: usize,
        _: Option<&str>,
    ) -> Result<Page<DetailRecord>, StoreError> {
        Ok(Page {
            items: Vec::new(),
            next_token: None,
        })
    }
}

/// Helper to assert every average lies in [0, 1].
///
/// # Example
/// ```ignore
/// let summary = aggregator.aggregate(&request).await?;
/// assert_averages_in_unit_range(&summary)?;
/// ```
pub fn assert_averages_in_unit_range(summary: &AggregatedSummary) -> Result<()> {
    if let Some((metric, value)) = summary
        .averages
        .iter()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        anyhow::bail!(
            "Evaluation {}: average {} = {} is outside [0, 1]\n{}",
            summary.evaluation_id,
            metric,
            value,
            summary.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert `total_questions` equals the scored cases of `partials`.
pub fn assert_total_questions(summary: &AggregatedSummary, partials: &[PartialResult]) -> Result<()> {
    let expected: usize = partials.iter().map(|p| p.num_test_cases).sum();
    if summary.total_questions != expected {
        anyhow::bail!(
            "Evaluation {}: total_questions {} but partial results hold {}\n{}",
            summary.evaluation_id,
            summary.total_questions,
            expected,
            summary.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert a minimum number of scored questions.
pub fn assert_min_scored(summary: &AggregatedSummary, min: usize) -> Result<()> {
    if summary.total_questions < min {
        anyhow::bail!(
            "Evaluation {}: {} questions scored, expected at least {}\n{}",
            summary.evaluation_id,
            summary.total_questions,
            min,
            summary.summary_table()
        );
    }
    Ok(())
}
