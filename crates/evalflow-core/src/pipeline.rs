use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{AggregateRequest, Aggregator};
use crate::artifact::ArtifactStore;
use crate::chat::ChatClient;
use crate::cleanup::Cleanup;
use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::evaluator::{Evaluator, EvaluatorSettings};
use crate::persister::Persister;
use crate::scoring::ScoringService;
use crate::splitter::{SplitRequest, Splitter, DEFAULT_CHUNK_SIZE};
use evalflow_store::ResultsStore;
use evalflow_types::{
	AggregatedSummary, ChunkOutcome, CleanupReport, PersistOutput, SplitOutput, StepOutcome, TestCase,
};

pub struct PipelineBuilder {
	artifacts: Option<Arc<dyn ArtifactStore>>,
	chat: Option<Arc<dyn ChatClient>>,
	scoring: Option<Arc<dyn ScoringService>>,
	results: Option<Arc<dyn ResultsStore>>,
	settings: EvaluatorSettings,
	chunk_size: usize,
	max_concurrency: usize,
	min_success_ratio: f64,
	retry: RetryPolicy,
	cancel: CancellationToken,
}

impl PipelineBuilder {
	pub fn new() -> Self {
		Self {
			artifacts: None,
			chat: None,
			scoring: None,
			results: None,
			settings: EvaluatorSettings::default(),
			chunk_size: DEFAULT_CHUNK_SIZE,
			max_concurrency: 5,
			min_success_ratio: 0.0,
			retry: RetryPolicy::default(),
			cancel: CancellationToken::new(),
		}
	}

	/// Take every tunable from `config`. Collaborators are still set
	/// separately.
	pub fn config(mut self, config: &PipelineConfig) -> Self {
		self.settings = config.evaluator_settings();
		self.chunk_size = config.chunk_size.max(1);
		self.max_concurrency = config.max_concurrency.max(1);
		self.min_success_ratio = config.min_success_ratio;
		self.retry = config.retry;
		self
	}

	pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
		self.artifacts = Some(artifacts);
		self
	}

	pub fn chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
		self.chat = Some(chat);
		self
	}

	pub fn scoring(mut self, scoring: Arc<dyn ScoringService>) -> Self {
		self.scoring = Some(scoring);
		self
	}

	pub fn results(mut self, results: Arc<dyn ResultsStore>) -> Self {
		self.results = Some(results);
		self
	}

	pub fn settings(mut self, settings: EvaluatorSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn chunk_size(mut self, n: usize) -> Self {
		self.chunk_size = n.max(1);
		self
	}

	pub fn max_concurrency(mut self, n: usize) -> Self {
		self.max_concurrency = n.max(1);
		self
	}

	pub fn min_success_ratio(mut self, ratio: f64) -> Self {
		self.min_success_ratio = ratio;
		self
	}

	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = token;
		self
	}

	pub fn build(self) -> Result<Pipeline> {
		let artifacts = self.artifacts.ok_or_else(|| anyhow::anyhow!("artifacts must be set"))?;
		let chat = self.chat.ok_or_else(|| anyhow::anyhow!("chat must be set"))?;
		let scoring = self.scoring.ok_or_else(|| anyhow::anyhow!("scoring must be set"))?;
		let results = self.results.ok_or_else(|| anyhow::anyhow!("results must be set"))?;
		let strategy = self.settings.strategy;

		Ok(Pipeline {
			splitter: Splitter::new(artifacts.clone(), self.chunk_size),
			evaluator: Evaluator::new(artifacts.clone(), chat, scoring, self.settings)
				.with_cancellation(self.cancel.clone()),
			aggregator: Aggregator::new(artifacts.clone(), self.min_success_ratio),
			persister: Persister::new(artifacts.clone(), results),
			cleanup: Cleanup::new(artifacts),
			strategy,
			max_concurrency: self.max_concurrency,
			retry: self.retry,
			cancel: self.cancel,
		})
	}
}

impl Default for PipelineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
	pub split: SplitOutput,
	pub chunks: Vec<ChunkOutcome>,
	/// Chunks whose evaluation still failed after retries, with the error.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub failed_chunks: Vec<(usize, String)>,
	pub summary: AggregatedSummary,
	pub persisted: PersistOutput,
	pub cleanup: CleanupReport,
}

/// Local orchestrator: split, bounded evaluation fan-out, aggregate,
/// persist, then clean up.
pub struct Pipeline {
	splitter: Splitter,
	evaluator: Evaluator,
	aggregator: Aggregator,
	persister: Persister,
	cleanup: Cleanup,
	strategy: evalflow_types::ScoringStrategy,
	max_concurrency: usize,
	retry: RetryPolicy,
	cancel: CancellationToken,
}

impl Pipeline {
	pub fn builder() -> PipelineBuilder {
		PipelineBuilder::new()
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Run every step for the source named in `request`.
	///
	/// On failure or cancellation the intermediate artifacts are kept so the
	/// run can be resumed, and the outcome carries the evaluation id when
	/// known.
	pub async fn run(&self, request: SplitRequest) -> StepOutcome<RunReport> {
		let request = request.with_resolved_id();
		let split = with_retry(self.retry, "split", || self.splitter.split(request.clone())).await;
		self.finish(split).await
	}

	/// Like [`Pipeline::run`] for test cases already in memory.
	pub async fn run_cases(&self, request: SplitRequest, cases: Vec<TestCase>) -> StepOutcome<RunReport> {
		let request = request.with_resolved_id();
		let split = with_retry(self.retry, "split", || {
			self.splitter.split_cases(request.clone(), cases.clone())
		})
		.await;
		self.finish(split).await
	}

	async fn finish(&self, split: Result<SplitOutput, PipelineError>) -> StepOutcome<RunReport> {
		match split {
			Ok(split) => match self.after_split(split).await {
				Ok(report) => StepOutcome::Succeeded(report),
				Err(e) => failed(e),
			},
			Err(e) => failed(e),
		}
	}

	async fn after_split(&self, split: SplitOutput) -> Result<RunReport, PipelineError> {
		let outcomes: Vec<(usize, Result<ChunkOutcome, PipelineError>)> = stream::iter(split.chunks.iter())
			.map(|chunk| async move {
				let outcome = with_retry(self.retry, "evaluate", || self.evaluator.evaluate_chunk(chunk)).await;
				(chunk.chunk_index, outcome)
			})
			.buffer_unordered(self.max_concurrency)
			.collect()
			.await;

		if self.cancel.is_cancelled() {
			warn!(evaluation_id = %split.evaluation_id, "run cancelled, keeping artifacts");
			return Err(PipelineError::Cancelled {
				evaluation_id: split.evaluation_id.clone(),
			});
		}

		let mut chunks = Vec::new();
		let mut failed_chunks = Vec::new();
		for (chunk_index, outcome) in outcomes {
			match outcome {
				Ok(outcome) => chunks.push(outcome),
				Err(e) => {
					warn!(evaluation_id = %split.evaluation_id, chunk_index, error = %e, "chunk evaluation failed");
					failed_chunks.push((chunk_index, e.to_string()));
				}
			}
		}
		chunks.sort_by_key(|c| c.chunk_index);
		failed_chunks.sort_by_key(|(i, _)| *i);

		let request = AggregateRequest::from_split(&split, self.strategy);
		let summary = with_retry(self.retry, "aggregate", || self.aggregator.aggregate(&request)).await?;
		let persisted = with_retry(self.retry, "persist", || self.persister.persist(&summary)).await?;
		let cleanup = self.cleanup.run(&split.evaluation_id).await;

		info!(
			evaluation_id = %split.evaluation_id,
			total_questions = summary.total_questions,
			failed_chunks = failed_chunks.len(),
			"pipeline finished"
		);

		Ok(RunReport {
			split,
			chunks,
			failed_chunks,
			summary,
			persisted,
			cleanup,
		})
	}
}

fn failed<T>(e: PipelineError) -> StepOutcome<T> {
	error!(evaluation_id = e.evaluation_id().unwrap_or("-"), error = %e, "pipeline failed");
	StepOutcome::failed(e.evaluation_id().map(str::to_string), e)
}

/// Run `step` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_attempts`.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, name: &str, mut step: F) -> Result<T, PipelineError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, PipelineError>>,
{
	let mut attempt = 1;
	loop {
		match step().await {
			Ok(value) => return Ok(value),
			Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
				warn!(step = name, attempt, error = %e, "step failed, retrying");
				tokio::time::sleep(policy.delay_for(attempt)).await;
				attempt += 1;
			}
			Err(e) => return Err(e),
		}
	}
}
