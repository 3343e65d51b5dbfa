use std::future::Future;
use std::sync::Arc;

use anyhow::{ensure, Result};
use async_trait::async_trait;

use super::TextSimilarity;

/// Source of text embeddings, usually a remote model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Wrap an async closure as an `Embedder`.
pub fn embedder_from_fn<F, Fut>(f: F) -> Arc<dyn Embedder>
where
    F: Send + Sync + 'static + Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<f32>>> + Send + 'static,
{
    struct ClosureEmbedder<F> {
        f: F,
    }

    #[async_trait]
    impl<F, Fut> Embedder for ClosureEmbedder<F>
    where
        F: Send + Sync + 'static + Fn(String) -> Fut,
        Fut: Future<Output = Result<Vec<f32>>> + Send + 'static,
    {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            (self.f)(text.to_owned()).await
        }
    }

    Arc::new(ClosureEmbedder { f })
}

/// Cosine similarity of embeddings, clamped to [0, 1].
pub struct EmbeddingSimilarity {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingSimilarity {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl TextSimilarity for EmbeddingSimilarity {
    fn name(&self) -> &'static str {
        "embedding_cosine"
    }

    async fn similarity(&self, a: &str, b: &str) -> Result<f64> {
        let a_vec = self.embedder.embed(a).await?;
        let b_vec = self.embedder.embed(b).await?;
        ensure!(
            a_vec.len() == b_vec.len(),
            "embedding dimensions differ: {} vs {}",
            a_vec.len(),
            b_vec.len()
        );
        Ok(cosine_similarity(&a_vec, &b_vec).clamp(0.0, 1.0))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (a_val, b_val) in a.iter().zip(b.iter()) {
        let x = *a_val as f64;
        let y = *b_val as f64;

        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
