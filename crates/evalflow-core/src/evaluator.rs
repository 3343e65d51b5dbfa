use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{read_json, write_json, ArtifactStore};
use crate::chat::{ChatClient, ChatRequest, ChatResponse};
use crate::error::{CaseError, PipelineError};
use crate::keys;
use crate::scoring::{RawScores, ScoreRequest, ScoringService};
use evalflow_types::{
    CaseStatus, ChunkDescriptor, ChunkOutcome, DetailedResult, Metric, MetricScores,
    PartialResult, ScoringStrategy, TestCase,
};

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub strategy: ScoringStrategy,
    pub chat_timeout: Duration,
    pub scoring_timeout: Duration,
    /// Extra scoring attempts after the first failure.
    pub scoring_retries: u32,
    pub retry_delay: Duration,
    /// Substituted for a missing or out-of-range metric.
    pub fallback_score: f64,
    /// Cases of one chunk evaluated at the same time.
    pub case_concurrency: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            strategy: ScoringStrategy::default(),
            chat_timeout: Duration::from_secs(60),
            scoring_timeout: Duration::from_secs(120),
            scoring_retries: 2,
            retry_delay: Duration::from_millis(2000),
            fallback_score: 0.5,
            case_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseState {
    Pending,
    QueryingChat,
    Scoring,
    Scored,
    Failed,
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::QueryingChat => "querying_chat",
            Self::Scoring => "scoring",
            Self::Scored => "scored",
            Self::Failed => "failed",
        })
    }
}

/// Evaluates one chunk at a time. Holds no state between chunks, so one
/// instance can serve every chunk of a fan-out concurrently.
pub struct Evaluator {
    store: Arc<dyn ArtifactStore>,
    chat: Arc<dyn ChatClient>,
    scoring: Arc<dyn ScoringService>,
    settings: EvaluatorSettings,
    cancel: CancellationToken,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        chat: Arc<dyn ChatClient>,
        scoring: Arc<dyn ScoringService>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            store,
            chat,
            scoring,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Once `token` fires, in-flight cases stop and the chunk fails with
    /// [`PipelineError::Cancelled`] without writing a partial result, so a
    /// resumed run evaluates it again.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn settings(&self) -> &EvaluatorSettings {
        &self.settings
    }

    /// Evaluate every case of `chunk` and write its partial result,
    /// overwriting any result left by an earlier attempt.
    pub async fn evaluate_chunk(&self, chunk: &ChunkDescriptor) -> Result<ChunkOutcome, PipelineError> {
        let cases: Vec<TestCase> = read_json(self.store.as_ref(), &chunk.chunk_key)
            .await
            .map_err(|e| PipelineError::ChunkUnreadable {
                evaluation_id: chunk.evaluation_id.clone(),
                chunk_index: chunk.chunk_index,
                reason: e.to_string(),
            })?;

        debug!(
            evaluation_id = %chunk.evaluation_id,
            chunk_index = chunk.chunk_index,
            cases = cases.len(),
            "evaluating chunk"
        );

        let first = chunk.first_question_index;
        let detailed_results: Vec<DetailedResult> = stream::iter(cases.into_iter().enumerate())
            .map(|(i, case)| self.evaluate_case(first + i, case))
            .buffered(self.settings.case_concurrency.max(1))
            .collect()
            .await;

        if self.cancel.is_cancelled() {
            warn!(
                evaluation_id = %chunk.evaluation_id,
                chunk_index = chunk.chunk_index,
                "chunk cancelled, partial result not written"
            );
            return Err(PipelineError::Cancelled {
                evaluation_id: chunk.evaluation_id.clone(),
            });
        }

        let mut sums: MetricScores = self
            .settings
            .strategy
            .metrics()
            .iter()
            .map(|m| (*m, 0.0))
            .collect();
        let mut num_test_cases = 0;
        let mut num_failed = 0;
        for result in &detailed_results {
            if result.is_scored() {
                num_test_cases += 1;
                for (metric, value) in &result.scores {
                    *sums.entry(*metric).or_insert(0.0) += value;
                }
            } else {
                num_failed += 1;
            }
        }

        let partial = PartialResult {
            evaluation_id: chunk.evaluation_id.clone(),
            chunk_index: chunk.chunk_index,
            detailed_results,
            sums,
            num_test_cases,
            num_failed,
        };
        let partial_result_key = keys::partial_result_key(&chunk.evaluation_id, chunk.chunk_index);
        write_json(self.store.as_ref(), &partial_result_key, &partial)
            .await
            .map_err(|e| PipelineError::artifact(&chunk.evaluation_id, e))?;

        if num_failed > 0 {
            warn!(
                evaluation_id = %chunk.evaluation_id,
                chunk_index = chunk.chunk_index,
                num_failed,
                "some test cases could not be scored"
            );
        }
        info!(
            evaluation_id = %chunk.evaluation_id,
            chunk_index = chunk.chunk_index,
            num_test_cases,
            num_failed,
            "chunk evaluated"
        );

        Ok(ChunkOutcome {
            evaluation_id: chunk.evaluation_id.clone(),
            chunk_index: chunk.chunk_index,
            partial_result_key,
            num_test_cases,
            num_failed,
        })
    }

    async fn evaluate_case(&self, question_index: usize, case: TestCase) -> DetailedResult {
        let mut result = DetailedResult {
            question_index,
            question: case.question,
            expected_response: case.expected_response,
            actual_response: String::new(),
            status: CaseStatus::Failed,
            scores: MetricScores::new(),
            error: None,
            retrieved_context: None,
            sources: Vec::new(),
        };
        trace_state(question_index, CaseState::Pending);

        trace_state(question_index, CaseState::QueryingChat);
        let response = match self.ask(&result.question).await {
            Ok(response) => response,
            Err(e) => return fail(result, e),
        };
        result.retrieved_context = response.retrieved_context();
        result.actual_response = response.answer;
        result.sources = response.sources;

        trace_state(question_index, CaseState::Scoring);
        let request = ScoreRequest {
            question: result.question.clone(),
            answer: result.actual_response.clone(),
            reference: result.expected_response.clone(),
            context: result.retrieved_context.clone(),
            metrics: self.settings.strategy.metrics().to_vec(),
        };
        let normalized = self.score(&request).await.and_then(|raw| {
            normalize_scores(&raw, self.settings.strategy.metrics(), self.settings.fallback_score)
        });
        match normalized {
            Ok((scores, note)) => {
                result.status = CaseStatus::Scored;
                result.scores = scores;
                result.error = note;
                trace_state(question_index, CaseState::Scored);
                result
            }
            Err(e) => fail(result, e),
        }
    }

    async fn ask(&self, question: &str) -> Result<ChatResponse, CaseError> {
        let request = ChatRequest::new(question);
        let call = tokio::time::timeout(self.settings.chat_timeout, self.chat.ask(&request));
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CaseError::Cancelled),
            outcome = call => outcome
                .map_err(|_| CaseError::ChatTimeout(self.settings.chat_timeout))?
                .map_err(|e| CaseError::Chat(format!("{e:#}")))?,
        };
        if response.answer.trim().is_empty() {
            return Err(CaseError::EmptyAnswer);
        }
        Ok(response)
    }

    async fn score(&self, request: &ScoreRequest) -> Result<RawScores, CaseError> {
        let attempts = self.settings.scoring_retries.saturating_add(1);
        let mut last_error = CaseError::Scoring("no attempt made".to_string());
        for attempt in 1..=attempts {
            let call = tokio::time::timeout(self.settings.scoring_timeout, self.scoring.score(request));
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CaseError::Cancelled),
                outcome = call => outcome,
            };
            last_error = match outcome {
                Ok(Ok(raw)) => return Ok(raw),
                Ok(Err(e)) => CaseError::Scoring(format!("{e:#}")),
                Err(_) => CaseError::ScoringTimeout(self.settings.scoring_timeout),
            };
            if attempt < attempts {
                warn!(attempt, attempts, error = %last_error, "scoring attempt failed, retrying");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(CaseError::Cancelled),
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }
        }
        Err(last_error)
    }
}

fn trace_state(question_index: usize, state: CaseState) {
    debug!(question_index, state = %state, "case transition");
}

fn fail(mut result: DetailedResult, error: CaseError) -> DetailedResult {
    trace_state(result.question_index, CaseState::Failed);
    warn!(question_index = result.question_index, error = %error, "test case failed");
    result.status = CaseStatus::Failed;
    result.scores.clear();
    result.error = Some(error.to_string());
    result
}

/// Resolve raw service output into exactly `metrics`.
///
/// A missing, non-finite or out-of-range value is replaced with `fallback`
/// and named in the returned note. If no metric is usable the case fails.
pub fn normalize_scores(
    raw: &RawScores,
    metrics: &[Metric],
    fallback: f64,
) -> Result<(MetricScores, Option<String>), CaseError> {
    let mut scores = MetricScores::new();
    let mut fell_back = Vec::new();
    for metric in metrics {
        match raw.get(metric.name()).copied().flatten() {
            Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => {
                scores.insert(*metric, v);
            }
            _ => {
                scores.insert(*metric, fallback);
                fell_back.push(metric.name());
            }
        }
    }

    if !metrics.is_empty() && fell_back.len() == metrics.len() {
        return Err(CaseError::MalformedScores(format!(
            "no valid value for {}",
            fell_back.join(", ")
        )));
    }
    let note = (!fell_back.is_empty())
        .then(|| format!("fallback score {fallback} used for: {}", fell_back.join(", ")));
    Ok((scores, note))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::{chat, scoring};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(pairs: &[(&str, Option<f64>)]) -> RawScores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn fast_settings(strategy: ScoringStrategy) -> EvaluatorSettings {
        EvaluatorSettings {
            strategy,
            chat_timeout: Duration::from_millis(200),
            scoring_timeout: Duration::from_millis(200),
            scoring_retries: 2,
            retry_delay: Duration::from_millis(1),
            fallback_score: 0.5,
            case_concurrency: 2,
        }
    }

    async fn write_chunk(store: &MemoryArtifactStore, cases: &[TestCase]) -> ChunkDescriptor {
        let chunk_key = keys::chunk_key("e1", 1);
        write_json(store, &chunk_key, cases).await.unwrap();
        ChunkDescriptor {
            evaluation_id: "e1".into(),
            chunk_index: 1,
            chunk_key,
            first_question_index: 15,
            len: cases.len(),
        }
    }

    fn constant_scoring(value: f64) -> Arc<dyn ScoringService> {
        scoring::from_async_fn(move |req| {
            let scores: RawScores = req
                .metrics
                .iter()
                .map(|m| (m.name().to_string(), Some(value)))
                .collect();
            async move { Ok(scores) }
        })
    }

    #[test]
    fn test_normalize_fills_invalid_values() {
        let metrics = ScoringStrategy::Standard.metrics();
        let (scores, note) = normalize_scores(
            &raw(&[("similarity", Some(0.9)), ("relevance", Some(f64::NAN))]),
            metrics,
            0.5,
        )
        .unwrap();
        assert_eq!(scores[&Metric::Similarity], 0.9);
        assert_eq!(scores[&Metric::Relevance], 0.5);
        assert_eq!(scores[&Metric::Correctness], 0.5);
        let note = note.unwrap();
        assert!(note.contains("relevance") && note.contains("correctness"));

        let (_, note) = normalize_scores(
            &raw(&[("similarity", Some(1.0)), ("relevance", Some(0.0)), ("correctness", Some(0.3))]),
            metrics,
            0.5,
        )
        .unwrap();
        assert_eq!(note, None);
    }

    #[test]
    fn test_normalize_rejects_all_unusable() {
        let err = normalize_scores(
            &raw(&[("similarity", Some(1.7)), ("relevance", None)]),
            ScoringStrategy::Standard.metrics(),
            0.5,
        )
        .unwrap_err();
        assert!(matches!(err, CaseError::MalformedScores(_)));
    }

    #[tokio::test]
    async fn test_chunk_sums_and_indices() {
        let store = Arc::new(MemoryArtifactStore::new());
        let cases = vec![TestCase::new("q0", "a0"), TestCase::new("q1", "a1"), TestCase::new("q2", "a2")];
        let chunk = write_chunk(&store, &cases).await;

        let chat = chat::from_async_fn(|req| {
            let q = req.question.clone();
            async move {
                if q == "q1" {
                    anyhow::bail!("upstream 500");
                }
                Ok(ChatResponse::new(format!("answer to {q}")))
            }
        });
        let evaluator = Evaluator::new(
            store.clone(),
            chat,
            constant_scoring(0.8),
            fast_settings(ScoringStrategy::Standard),
        );

        let outcome = evaluator.evaluate_chunk(&chunk).await.unwrap();
        assert_eq!(outcome.num_test_cases, 2);
        assert_eq!(outcome.num_failed, 1);
        assert_eq!(outcome.partial_result_key, "evaluations/e1/partial_results/chunk_1.json");

        let partial: PartialResult = read_json(store.as_ref(), &outcome.partial_result_key).await.unwrap();
        assert_eq!(
            partial.detailed_results.iter().map(|r| r.question_index).collect::<Vec<_>>(),
            vec![15, 16, 17]
        );
        let failed = &partial.detailed_results[1];
        assert_eq!(failed.status, CaseStatus::Failed);
        assert!(failed.scores.is_empty());
        assert!(failed.error.as_deref().unwrap().contains("upstream 500"));
        assert!((partial.sums[&Metric::Similarity] - 1.6).abs() < 1e-9);
        assert_eq!(partial.sums.len(), 3);
    }

    #[tokio::test]
    async fn test_scoring_is_retried() {
        let store = Arc::new(MemoryArtifactStore::new());
        let chunk = write_chunk(&store, &[TestCase::new("q", "a")]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let scoring = scoring::from_async_fn(move |req| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let scores: RawScores = req
                .metrics
                .iter()
                .map(|m| (m.name().to_string(), Some(0.7)))
                .collect();
            async move {
                if n < 2 {
                    anyhow::bail!("throttled");
                }
                Ok(scores)
            }
        });
        let chat = chat::from_async_fn(|_| async { Ok(ChatResponse::new("a")) });
        let evaluator = Evaluator::new(store, chat, scoring, fast_settings(ScoringStrategy::Standard));

        let outcome = evaluator.evaluate_chunk(&chunk).await.unwrap();
        assert_eq!(outcome.num_test_cases, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeouts_and_empty_answers_fail_cases() {
        let store = Arc::new(MemoryArtifactStore::new());
        let chunk = write_chunk(&store, &[TestCase::new("slow", "a"), TestCase::new("blank", "a")]).await;
        let chat = chat::from_async_fn(|req| {
            let q = req.question.clone();
            async move {
                if q == "slow" {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(ChatResponse::new(""))
            }
        });
        let evaluator = Evaluator::new(
            store.clone(),
            chat,
            constant_scoring(1.0),
            fast_settings(ScoringStrategy::Standard),
        );

        let outcome = evaluator.evaluate_chunk(&chunk).await.unwrap();
        assert_eq!(outcome.num_test_cases, 0);
        assert_eq!(outcome.num_failed, 2);
        let partial: PartialResult = read_json(store.as_ref(), &outcome.partial_result_key).await.unwrap();
        assert_eq!(
            partial.detailed_results[0].error.as_deref(),
            Some("chat request timed out after 200ms")
        );
        assert_eq!(
            partial.detailed_results[1].error.as_deref(),
            Some("chat returned an empty answer")
        );
    }

    #[tokio::test]
    async fn test_cancelled_chunk_writes_no_partial() {
        let store = Arc::new(MemoryArtifactStore::new());
        let chunk = write_chunk(&store, &[TestCase::new("q", "a"), TestCase::new("q2", "a")]).await;
        let token = CancellationToken::new();
        let trigger = token.clone();
        let chat = chat::from_async_fn(move |_| {
            trigger.cancel();
            async { Ok(ChatResponse::new("a")) }
        });
        let evaluator = Evaluator::new(store.clone(), chat, constant_scoring(1.0), fast_settings(ScoringStrategy::Standard))
            .with_cancellation(token);

        let err = evaluator.evaluate_chunk(&chunk).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { ref evaluation_id } if evaluation_id == "e1"));
        assert!(!err.is_retryable());
        assert!(store
            .get(&keys::partial_result_key("e1", 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_chunk_is_unreadable() {
        let store = Arc::new(MemoryArtifactStore::new());
        let chat = chat::from_async_fn(|_| async { Ok(ChatResponse::new("a")) });
        let evaluator = Evaluator::new(store, chat, constant_scoring(1.0), EvaluatorSettings::default());
        let chunk = ChunkDescriptor {
            evaluation_id: "e1".into(),
            chunk_index: 4,
            chunk_key: keys::chunk_key("e1", 4),
            first_question_index: 60,
            len: 15,
        };
        let err = evaluator.evaluate_chunk(&chunk).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChunkUnreadable { chunk_index: 4, .. }));
        assert!(err.is_retryable());
    }
}
