//! evalflow-store: durable results store for finished evaluations.
//!
//! One summary row per evaluation and one detail row per question. All
//! writes are upserts so a retried persist step never duplicates rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use evalflow_types::{CaseStatus, MetricScores, ScoringStrategy};

mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid continuation token: {0}")]
    InvalidToken(String),

    #[error("results store connection lock poisoned")]
    LockPoisoned,

    #[error("results store task failed: {0}")]
    Join(String),
}

/// Summary row, keyed by `evaluation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub evaluation_id: String,
    pub evaluation_name: String,
    pub test_cases_key: String,
    pub detailed_results_key: String,
    pub strategy: ScoringStrategy,
    pub averages: MetricScores,
    pub total_questions: usize,
    pub failed_questions: usize,
    /// Set on first insert; upserts keep the original value.
    pub created_at: DateTime<Utc>,
}

/// Detail row, keyed by `(evaluation_id, question_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub evaluation_id: String,
    pub question_index: usize,
    pub question: String,
    pub expected_response: String,
    pub actual_response: String,
    pub status: CaseStatus,
    pub scores: MetricScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_context: Option<String>,
}

/// One page of a listing plus the token for the next page, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[async_trait]
pub trait ResultsStore: Send + Sync {
    /// Insert or replace an evaluation's summary and detail rows.
    ///
    /// Detail rows of the same evaluation that are not in `details` are
    /// removed, so the stored set always mirrors the latest write.
    async fn upsert_evaluation(
        &self,
        summary: &SummaryRecord,
        details: &[DetailRecord],
    ) -> Result<(), StoreError>;

    async fn get_summary(&self, evaluation_id: &str) -> Result<Option<SummaryRecord>, StoreError>;

    /// Summaries, most recent first.
    async fn list_summaries(
        &self,
        limit: usize,
        token: Option<&str>,
    ) -> Result<Page<SummaryRecord>, StoreError>;

    /// Detail rows for one evaluation, in question order.
    async fn list_results(
        &self,
        evaluation_id: &str,
        limit: usize,
        token: Option<&str>,
    ) -> Result<Page<DetailRecord>, StoreError>;
}

pub(crate) fn parse_token(token: Option<&str>) -> Result<usize, StoreError> {
    match token {
        None => Ok(0),
        Some(t) => t
            .trim()
            .parse::<usize>()
            .map_err(|_| StoreError::InvalidToken(t.to_string())),
    }
}

pub(crate) fn status_name(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Scored => "scored",
        CaseStatus::Failed => "failed",
    }
}

pub(crate) fn parse_status(s: &str) -> Option<CaseStatus> {
    match s {
        "scored" => Some(CaseStatus::Scored),
        "failed" => Some(CaseStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(None).unwrap(), 0);
        assert_eq!(parse_token(Some("20")).unwrap(), 20);
        assert!(matches!(
            parse_token(Some("abc")),
            Err(StoreError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [CaseStatus::Scored, CaseStatus::Failed] {
            assert_eq!(parse_status(status_name(status)), Some(status));
        }
        assert_eq!(parse_status("pending"), None);
    }
}
