//! Offline scoring service built on a pairwise text similarity.
//!
//! Metrics are sentence-level: texts are split into sentences and each
//! sentence is matched against its best counterpart.

use anyhow::Result;
use async_trait::async_trait;

use crate::scoring::{RawScores, ScoreRequest, ScoringService};
use evalflow_types::Metric;

/// Symmetric similarity between two texts, in [0, 1].
#[async_trait]
pub trait TextSimilarity: Send + Sync {
    fn name(&self) -> &'static str;
    async fn similarity(&self, a: &str, b: &str) -> Result<f64>;
}

/// Number of best-matching context passages averaged for context precision.
const CONTEXT_PRECISION_TOP_K: usize = 3;

pub struct SimilarityScoringService<S> {
    similarity: S,
}

impl<S: TextSimilarity> SimilarityScoringService<S> {
    pub fn new(similarity: S) -> Self {
        Self { similarity }
    }

    /// Mean over `sentences` of each one's best match in `against`.
    async fn mean_best_match(&self, sentences: &[&str], against: &[&str]) -> Result<f64> {
        if sentences.is_empty() || against.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for s in sentences {
            total += self.best_match(s, against).await?;
        }
        Ok(total / sentences.len() as f64)
    }

    async fn best_match(&self, sentence: &str, against: &[&str]) -> Result<f64> {
        let mut best = 0.0f64;
        for other in against {
            best = best.max(self.similarity.similarity(sentence, other).await?);
        }
        Ok(best)
    }

    async fn correctness(&self, answer: &[&str], reference: &[&str]) -> Result<f64> {
        let precision = self.mean_best_match(answer, reference).await?;
        let recall = self.mean_best_match(reference, answer).await?;
        if precision + recall == 0.0 {
            return Ok(0.0);
        }
        Ok(2.0 * precision * recall / (precision + recall))
    }

    async fn context_precision(&self, question: &str, passages: &[&str]) -> Result<f64> {
        let mut scores = Vec::with_capacity(passages.len());
        for p in passages {
            scores.push(self.similarity.similarity(question, p).await?);
        }
        scores.sort_by(|a, b| b.total_cmp(a));
        let top: Vec<f64> = scores.into_iter().take(CONTEXT_PRECISION_TOP_K).collect();
        if top.is_empty() {
            return Ok(0.0);
        }
        Ok(top.iter().sum::<f64>() / top.len() as f64)
    }
}

#[async_trait]
impl<S: TextSimilarity> ScoringService for SimilarityScoringService<S> {
    async fn score(&self, request: &ScoreRequest) -> Result<RawScores> {
        let answer = split_sentences(&request.answer);
        let reference = split_sentences(&request.reference);
        let passages: Vec<&str> = request
            .context
            .as_deref()
            .map(|c| c.lines().map(str::trim).filter(|l| !l.is_empty()).collect())
            .unwrap_or_default();

        let mut scores = RawScores::new();
        for metric in &request.metrics {
            let value = match metric {
                Metric::Similarity => Some(
                    self.similarity
                        .similarity(&request.answer, &request.reference)
                        .await?,
                ),
                Metric::Relevance => Some(
                    self.similarity
                        .similarity(&request.answer, &request.question)
                        .await?,
                ),
                Metric::Correctness => Some(self.correctness(&answer, &reference).await?),
                Metric::ResponseRelevancy => {
                    Some(self.mean_best_match(&answer, &[request.question.as_str()]).await?)
                }
                // Retrieval metrics are undefined without retrieved context.
                _ if passages.is_empty() => None,
                Metric::ContextPrecision => {
                    Some(self.context_precision(&request.question, &passages).await?)
                }
                Metric::ContextRecall => Some(self.mean_best_match(&reference, &passages).await?),
                Metric::Faithfulness => Some(self.mean_best_match(&answer, &passages).await?),
            };
            scores.insert(metric.name().to_string(), value);
        }
        Ok(scores)
    }
}

/// Split on sentence punctuation and newlines; a text without any
/// terminator is one sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    text.split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
