use anyhow::Result;
use async_trait::async_trait;
use strsim::{normalized_levenshtein, sorensen_dice};

use super::TextSimilarity;

/// Character-level similarity with no external calls.
///
/// Scores are the larger of the bigram Sørensen–Dice coefficient and the
/// normalized Levenshtein similarity of the lowercased, whitespace-collapsed
/// texts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSimilarity;

impl LexicalSimilarity {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextSimilarity for LexicalSimilarity {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn similarity(&self, a: &str, b: &str) -> Result<f64> {
        let a = normalize(a);
        let b = normalize(b);
        if a.is_empty() || b.is_empty() {
            return Ok(if a == b { 1.0 } else { 0.0 });
        }
        let score = sorensen_dice(&a, &b).max(normalized_levenshtein(&a, &b));
        Ok(score.clamp(0.0, 1.0))
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_and_disjoint() {
        let sim = LexicalSimilarity::new();
        assert_eq!(sim.similarity("The Sky  is blue", "the sky is BLUE").await.unwrap(), 1.0);
        let low = sim.similarity("abc", "xyz").await.unwrap();
        assert!(low < 0.1, "{low}");
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let sim = LexicalSimilarity::new();
        assert_eq!(sim.similarity("", "  ").await.unwrap(), 1.0);
        assert_eq!(sim.similarity("", "text").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_partial_overlap_is_bounded() {
        let sim = LexicalSimilarity::new();
        let s = sim
            .similarity("Paris is the capital of France", "The capital of France is Paris")
            .await
            .unwrap();
        assert!(s > 0.5 && s <= 1.0, "{s}");
    }
}
