use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::{read_json, write_json, ArtifactStore};
use crate::error::PipelineError;
use crate::keys;
use evalflow_types::{
    AggregatedSummary, DetailedResult, MetricScores, PartialResult, ScoringStrategy, SplitOutput,
};

/// Partial results read at the same time.
const READ_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub evaluation_id: String,
    #[serde(default)]
    pub evaluation_name: String,
    #[serde(default)]
    pub test_cases_key: String,
    #[serde(default)]
    pub strategy: ScoringStrategy,
    /// Number of chunks the split produced. Counted from the chunk
    /// artifacts when absent.
    #[serde(default)]
    pub expected_chunks: Option<usize>,
}

impl AggregateRequest {
    pub fn from_split(split: &SplitOutput, strategy: ScoringStrategy) -> Self {
        Self {
            evaluation_id: split.evaluation_id.clone(),
            evaluation_name: split.evaluation_name.clone(),
            test_cases_key: split.test_cases_key.clone(),
            strategy,
            expected_chunks: Some(split.chunks.len()),
        }
    }
}

/// Fan-in step: reduces every readable partial result into one summary.
pub struct Aggregator {
    store: Arc<dyn ArtifactStore>,
    min_success_ratio: f64,
}

impl Aggregator {
    pub fn new(store: Arc<dyn ArtifactStore>, min_success_ratio: f64) -> Self {
        Self {
            store,
            min_success_ratio: min_success_ratio.clamp(0.0, 1.0),
        }
    }

    pub async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregatedSummary, PipelineError> {
        let evaluation_id = request.evaluation_id.as_str();
        if evaluation_id.trim().is_empty() {
            return Err(PipelineError::MissingField {
                evaluation_id: None,
                field: "evaluation_id",
            });
        }

        let expected = match request.expected_chunks {
            Some(n) => n,
            None => self.count_chunks(evaluation_id).await?,
        };

        let reads: Vec<(usize, Option<PartialResult>)> = stream::iter(0..expected)
            .map(|chunk_index| async move {
                let key = keys::partial_result_key(evaluation_id, chunk_index);
                let partial = match read_json::<PartialResult>(self.store.as_ref(), &key).await {
                    Ok(p) if p.evaluation_id == evaluation_id && p.chunk_index == chunk_index => Some(p),
                    Ok(p) => {
                        warn!(
                            evaluation_id,
                            chunk_index,
                            found_evaluation = %p.evaluation_id,
                            found_chunk = p.chunk_index,
                            "partial result belongs to another chunk, skipping"
                        );
                        None
                    }
                    Err(e) => {
                        warn!(evaluation_id, chunk_index, error = %e, "partial result unreadable, skipping");
                        None
                    }
                };
                (chunk_index, partial)
            })
            .buffered(READ_CONCURRENCY)
            .collect()
            .await;

        let mut skipped_chunks = Vec::new();
        let mut sums = MetricScores::new();
        let mut total_questions = 0;
        let mut failed_questions = 0;
        let mut detailed: Vec<DetailedResult> = Vec::new();
        for (chunk_index, partial) in reads {
            let Some(partial) = partial else {
                skipped_chunks.push(chunk_index);
                continue;
            };
            for (metric, value) in &partial.sums {
                *sums.entry(*metric).or_insert(0.0) += value;
            }
            total_questions += partial.num_test_cases;
            failed_questions += partial.num_failed;
            detailed.extend(partial.detailed_results);
        }
        let chunks_read = expected - skipped_chunks.len();

        if expected > 0 && (chunks_read as f64) < self.min_success_ratio * expected as f64 {
            return Err(PipelineError::BelowSuccessThreshold {
                evaluation_id: evaluation_id.to_string(),
                read: chunks_read,
                expected,
                min_ratio: self.min_success_ratio,
            });
        }
        if total_questions == 0 {
            return Err(PipelineError::ZeroSuccessfulCases {
                evaluation_id: evaluation_id.to_string(),
            });
        }

        let averages: MetricScores = sums
            .into_iter()
            .map(|(metric, sum)| (metric, sum / total_questions as f64))
            .collect();
        for (metric, avg) in &averages {
            if !(0.0..=1.0).contains(avg) {
                warn!(evaluation_id, metric = %metric, average = avg, "average outside [0, 1]");
            }
        }

        detailed.sort_by_key(|r| r.question_index);
        let detailed_results_key = keys::detailed_results_key(evaluation_id);
        write_json(self.store.as_ref(), &detailed_results_key, &detailed)
            .await
            .map_err(|e| PipelineError::artifact(evaluation_id, e))?;

        info!(
            evaluation_id,
            total_questions,
            failed_questions,
            chunks_read,
            chunks_expected = expected,
            "aggregated results"
        );

        Ok(AggregatedSummary {
            evaluation_id: evaluation_id.to_string(),
            evaluation_name: request.evaluation_name.clone(),
            test_cases_key: request.test_cases_key.clone(),
            strategy: request.strategy,
            averages,
            total_questions,
            failed_questions,
            chunks_read,
            chunks_expected: expected,
            skipped_chunks,
            detailed_results_key,
        })
    }

    /// Chunk count from the chunk artifacts, or from the partial results if
    /// the chunks are gone.
    async fn count_chunks(&self, evaluation_id: &str) -> Result<usize, PipelineError> {
        for prefix in [
            keys::chunks_prefix(evaluation_id),
            keys::partial_results_prefix(evaluation_id),
        ] {
            let highest = self
                .store
                .list(&prefix)
                .await
                .map_err(|e| PipelineError::artifact(evaluation_id, e))?
                .iter()
                .filter_map(|key| keys::parse_chunk_index(key))
                .max();
            if let Some(highest) = highest {
                return Ok(highest + 1);
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use evalflow_types::{CaseStatus, Metric};
    use pretty_assertions::assert_eq;

    fn scored(question_index: usize, value: f64) -> DetailedResult {
        DetailedResult {
            question_index,
            question: format!("q{question_index}"),
            expected_response: "a".into(),
            actual_response: "a".into(),
            status: CaseStatus::Scored,
            scores: [(Metric::Similarity, value)].into_iter().collect(),
            error: None,
            retrieved_context: None,
            sources: vec![],
        }
    }

    async fn put_partial(store: &MemoryArtifactStore, chunk_index: usize, results: Vec<DetailedResult>) {
        let sums = [(
            Metric::Similarity,
            results.iter().map(|r| r.scores[&Metric::Similarity]).sum::<f64>(),
        )]
        .into_iter()
        .collect();
        let partial = PartialResult {
            evaluation_id: "e1".into(),
            chunk_index,
            num_test_cases: results.len(),
            num_failed: 0,
            detailed_results: results,
            sums,
        };
        write_json(store, &keys::partial_result_key("e1", chunk_index), &partial)
            .await
            .unwrap();
    }

    fn request(expected_chunks: Option<usize>) -> AggregateRequest {
        AggregateRequest {
            evaluation_id: "e1".into(),
            evaluation_name: "run".into(),
            test_cases_key: "k.json".into(),
            strategy: ScoringStrategy::Standard,
            expected_chunks,
        }
    }

    #[tokio::test]
    async fn test_weighted_average_and_order() {
        let store = Arc::new(MemoryArtifactStore::new());
        put_partial(&store, 1, vec![scored(2, 0.0)]).await;
        put_partial(&store, 0, vec![scored(0, 1.0), scored(1, 1.0)]).await;

        let summary = Aggregator::new(store.clone(), 0.0)
            .aggregate(&request(Some(2)))
            .await
            .unwrap();
        assert_eq!(summary.total_questions, 3);
        assert!((summary.averages[&Metric::Similarity] - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.chunks_read, 2);
        assert!(summary.skipped_chunks.is_empty());

        let merged: Vec<DetailedResult> = read_json(store.as_ref(), &summary.detailed_results_key).await.unwrap();
        assert_eq!(merged.iter().map(|r| r.question_index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_corrupt_and_missing_partials_are_skipped() {
        let store = Arc::new(MemoryArtifactStore::new());
        put_partial(&store, 0, vec![scored(0, 0.5)]).await;
        store
            .put(&keys::partial_result_key("e1", 2), b"{truncated".to_vec())
            .await
            .unwrap();

        let summary = Aggregator::new(store, 0.0)
            .aggregate(&request(Some(3)))
            .await
            .unwrap();
        assert_eq!(summary.total_questions, 1);
        assert_eq!(summary.chunks_read, 1);
        assert_eq!(summary.skipped_chunks, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_success_ratio_threshold() {
        let store = Arc::new(MemoryArtifactStore::new());
        put_partial(&store, 0, vec![scored(0, 0.5)]).await;

        let err = Aggregator::new(store, 0.75)
            .aggregate(&request(Some(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BelowSuccessThreshold { read: 1, expected: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_nothing_readable_is_zero_successful() {
        let store = Arc::new(MemoryArtifactStore::new());
        let err = Aggregator::new(store, 0.0)
            .aggregate(&request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ZeroSuccessfulCases { .. }));
    }

    #[tokio::test]
    async fn test_expected_count_from_chunk_listing() {
        let store = Arc::new(MemoryArtifactStore::new());
        for i in 0..3 {
            store.put(&keys::chunk_key("e1", i), b"[]".to_vec()).await.unwrap();
        }
        put_partial(&store, 0, vec![scored(0, 1.0)]).await;

        let summary = Aggregator::new(store, 0.0)
            .aggregate(&request(None))
            .await
            .unwrap();
        assert_eq!(summary.chunks_expected, 3);
        assert_eq!(summary.skipped_chunks, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_blank_evaluation_id_is_rejected() {
        let store = Arc::new(MemoryArtifactStore::new());
        let mut req = request(Some(1));
        req.evaluation_id = " ".into();
        let err = Aggregator::new(store, 0.0).aggregate(&req).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingField { field: "evaluation_id", .. }));
    }
}
