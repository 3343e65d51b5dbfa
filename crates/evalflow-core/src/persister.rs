use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::artifact::{read_json, ArtifactStore};
use crate::error::PipelineError;
use evalflow_store::{DetailRecord, ResultsStore, SummaryRecord};
use evalflow_types::{AggregatedSummary, DetailedResult, PersistOutput};

/// Writes an aggregated evaluation into the results store. Safe to run
/// any number of times for the same evaluation.
pub struct Persister {
    artifacts: Arc<dyn ArtifactStore>,
    results: Arc<dyn ResultsStore>,
}

impl Persister {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, results: Arc<dyn ResultsStore>) -> Self {
        Self { artifacts, results }
    }

    pub async fn persist(&self, summary: &AggregatedSummary) -> Result<PersistOutput, PipelineError> {
        validate(summary)?;
        let evaluation_id = summary.evaluation_id.as_str();

        let detailed: Vec<DetailedResult> =
            read_json(self.artifacts.as_ref(), &summary.detailed_results_key)
                .await
                .map_err(|e| PipelineError::Persistence {
                    evaluation_id: evaluation_id.to_string(),
                    reason: format!("reading {}: {e}", summary.detailed_results_key),
                })?;

        let record = SummaryRecord {
            evaluation_id: evaluation_id.to_string(),
            evaluation_name: summary.evaluation_name.clone(),
            test_cases_key: summary.test_cases_key.clone(),
            detailed_results_key: summary.detailed_results_key.clone(),
            strategy: summary.strategy,
            averages: summary.averages.clone(),
            total_questions: summary.total_questions,
            failed_questions: summary.failed_questions,
            created_at: Utc::now(),
        };
        let details: Vec<DetailRecord> = detailed
            .into_iter()
            .map(|r| DetailRecord {
                evaluation_id: evaluation_id.to_string(),
                question_index: r.question_index,
                question: r.question,
                expected_response: r.expected_response,
                actual_response: r.actual_response,
                status: r.status,
                scores: r.scores,
                error: r.error,
                retrieved_context: r.retrieved_context,
            })
            .collect();

        self.results
            .upsert_evaluation(&record, &details)
            .await
            .map_err(|e| PipelineError::Persistence {
                evaluation_id: evaluation_id.to_string(),
                reason: e.to_string(),
            })?;

        info!(evaluation_id, detail_rows = details.len(), "persisted evaluation");
        Ok(PersistOutput {
            evaluation_id: evaluation_id.to_string(),
            detail_rows: details.len(),
        })
    }
}

fn validate(summary: &AggregatedSummary) -> Result<(), PipelineError> {
    if summary.evaluation_id.trim().is_empty() {
        return Err(PipelineError::MissingField {
            evaluation_id: None,
            field: "evaluation_id",
        });
    }
    let missing = |field: &'static str| PipelineError::MissingField {
        evaluation_id: Some(summary.evaluation_id.clone()),
        field,
    };
    if summary.detailed_results_key.trim().is_empty() {
        return Err(missing("detailed_results_key"));
    }
    if summary.test_cases_key.trim().is_empty() {
        return Err(missing("test_cases_key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{write_json, MemoryArtifactStore};
    use crate::keys;
    use crate::testing::FailingResultsStore;
    use evalflow_store::SqliteStore;
    use evalflow_types::{CaseStatus, Metric, ScoringStrategy};

    fn summary() -> AggregatedSummary {
        AggregatedSummary {
            evaluation_id: "e1".into(),
            evaluation_name: "nightly".into(),
            test_cases_key: "test-cases/set.json".into(),
            strategy: ScoringStrategy::Standard,
            averages: [(Metric::Similarity, 0.75)].into_iter().collect(),
            total_questions: 2,
            failed_questions: 0,
            chunks_read: 1,
            chunks_expected: 1,
            skipped_chunks: vec![],
            detailed_results_key: keys::detailed_results_key("e1"),
        }
    }

    fn result(question_index: usize) -> DetailedResult {
        DetailedResult {
            question_index,
            question: format!("q{question_index}"),
            expected_response: "a".into(),
            actual_response: "a".into(),
            status: CaseStatus::Scored,
            scores: [(Metric::Similarity, 0.75)].into_iter().collect(),
            error: None,
            retrieved_context: None,
            sources: vec![],
        }
    }

    #[tokio::test]
    async fn test_persist_twice_is_idempotent() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        write_json(artifacts.as_ref(), &keys::detailed_results_key("e1"), &vec![result(0), result(1)])
            .await
            .unwrap();
        let results = Arc::new(SqliteStore::open_in_memory().unwrap());
        let persister = Persister::new(artifacts, results.clone());

        persister.persist(&summary()).await.unwrap();
        let first = results.get_summary("e1").await.unwrap().unwrap();
        let out = persister.persist(&summary()).await.unwrap();
        assert_eq!(out.detail_rows, 2);

        let second = results.get_summary("e1").await.unwrap().unwrap();
        assert_eq!(first, second);
        let page = results.list_results("e1", 10, None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(results.list_summaries(10, None).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let persister = Persister::new(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );

        let mut s = summary();
        s.evaluation_id = String::new();
        let err = persister.persist(&s).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingField { evaluation_id: None, field: "evaluation_id" }));

        let mut s = summary();
        s.test_cases_key = String::new();
        let err = persister.persist(&s).await.unwrap_err();
        assert_eq!(err.evaluation_id(), Some("e1"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_persistence_error() {
        let persister = Persister::new(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );
        let err = persister.persist(&summary()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence { ref evaluation_id, .. } if evaluation_id == "e1"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_write_failure_carries_evaluation_id() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        write_json(artifacts.as_ref(), &keys::detailed_results_key("e1"), &vec![result(0)])
            .await
            .unwrap();
        let persister = Persister::new(artifacts, Arc::new(FailingResultsStore::new("database is locked")));

        let err = persister.persist(&summary()).await.unwrap_err();
        match &err {
            PipelineError::Persistence { evaluation_id, reason } => {
                assert_eq!(evaluation_id, "e1");
                assert!(reason.contains("database is locked"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        assert_eq!(err.evaluation_id(), Some("e1"));
    }
}
