use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use evalflow_types::Metric;

/// Metric values exactly as the scoring service returned them, keyed by
/// metric name. Missing or null values are tolerated here and resolved by
/// the evaluator.
pub type RawScores = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
	pub question: String,
	pub answer: String,
	pub reference: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context: Option<String>,
	pub metrics: Vec<Metric>,
}

#[async_trait]
pub trait ScoringService: Send + Sync {
	async fn score(&self, request: &ScoreRequest) -> Result<RawScores>;
}

/// Wrap an async closure as a `ScoringService`.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn ScoringService>
where
	F: Send + Sync + 'static + Fn(&ScoreRequest) -> Fut,
	Fut: Future<Output = Result<RawScores>> + Send + 'static,
{
	struct ClosureScoring<F> {
		f: F,
	}

	#[async_trait]
	impl<F, Fut> ScoringService for ClosureScoring<F>
	where
		F: Send + Sync + 'static + Fn(&ScoreRequest) -> Fut,
		Fut: Future<Output = Result<RawScores>> + Send + 'static,
	{
		async fn score(&self, request: &ScoreRequest) -> Result<RawScores> {
			(self.f)(request).await
		}
	}

	Arc::new(ClosureScoring { f })
}

/// POSTs the request as JSON and expects `{"scores": {"<metric>": number|null}}`.
pub struct HttpScoringService {
	client: reqwest::Client,
	url: String,
}

impl HttpScoringService {
	pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("failed to build HTTP client")?;
		Ok(Self {
			client,
			url: url.into(),
		})
	}
}

#[derive(Deserialize)]
struct HttpScoresBody {
	scores: RawScores,
}

#[async_trait]
impl ScoringService for HttpScoringService {
	async fn score(&self, request: &ScoreRequest) -> Result<RawScores> {
		let resp = self.client.post(&self.url).json(request).send().await?;
		let status = resp.status();
		if !status.is_success() {
			let text = resp.text().await.unwrap_or_default();
			anyhow::bail!("HTTP {}: {}", status.as_u16(), text);
		}
		let body = resp
			.json::<HttpScoresBody>()
			.await
			.context("scoring response must be an object with a 'scores' map")?;
		Ok(body.scores)
	}
}
