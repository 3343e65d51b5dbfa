use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use evalflow_core::{
	AggregateRequest, Aggregator, ArtifactConfig, ArtifactStore, CancellationToken, ChatConfig, Cleanup, Evaluator,
	Persister, Pipeline, PipelineConfig, ScoringConfig, SplitRequest, Splitter,
};
use evalflow_store::{DetailRecord, ResultsStore, SqliteStore, SummaryRecord};
use evalflow_types::{
	detail_table, AggregatedSummary, ChunkOutcome, DetailedResult, ScoringStrategy, SplitOutput,
	StepOutcome,
};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "evalflow", about = "Run chunked LLM evaluations")]
struct Cli {
	/// YAML or JSON pipeline config
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Log at debug level
	#[arg(long, short, global = true, action = ArgAction::SetTrue)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run every step: split, evaluate, aggregate, persist, cleanup
	Run(RunArgs),
	/// Split a test-case set into chunks
	Split(SplitArgs),
	/// Evaluate the chunks of a split
	Evaluate(EvaluateArgs),
	/// Aggregate partial results; reads the split outcome
	Aggregate(StepArgs),
	/// Write an aggregated evaluation to the results store
	Persist(StepArgs),
	/// Delete intermediate artifacts of an evaluation
	Cleanup(CleanupArgs),
	/// List stored evaluation summaries, newest first
	Summaries(ListArgs),
	/// Show stored per-question results of one evaluation
	Results(ResultsArgs),
}

#[derive(Debug, Clone, Args)]
struct OverrideArgs {
	/// Chat endpoint; POSTs {"userMessage", "chatHistory"}
	#[arg(long)]
	chat_url: Option<String>,

	/// Scoring endpoint; omit to score offline with lexical similarity
	#[arg(long)]
	scoring_url: Option<String>,

	/// Metric set: standard or retrieval
	#[arg(long, value_parser = parse_strategy)]
	strategy: Option<ScoringStrategy>,

	/// Cases per chunk
	#[arg(long)]
	chunk_size: Option<usize>,

	/// Chunks evaluated at the same time
	#[arg(long)]
	max_concurrency: Option<usize>,

	/// Directory holding intermediate artifacts
	#[arg(long)]
	artifacts_dir: Option<PathBuf>,

	/// SQLite results database
	#[arg(long)]
	results_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
struct RunArgs {
	/// Test cases: .json, .jsonl or .csv
	#[arg(long)]
	data: PathBuf,

	#[arg(long)]
	name: Option<String>,

	/// Reuse an evaluation id; a re-run overwrites its artifacts and rows
	#[arg(long)]
	id: Option<String>,

	/// Write the run report as JSON to a file
	#[arg(long)]
	json_out: Option<PathBuf>,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct SplitArgs {
	/// Local test-case file, uploaded to `test-cases/<file name>`
	#[arg(long, conflicts_with = "key")]
	data: Option<PathBuf>,

	/// Artifact key of a test-case set already in the store
	#[arg(long)]
	key: Option<String>,

	#[arg(long)]
	name: Option<String>,

	#[arg(long)]
	id: Option<String>,

	/// Output file, `-` for stdout
	#[arg(long, default_value = "-")]
	output: String,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct EvaluateArgs {
	/// Split outcome JSON, `-` for stdin
	#[arg(long, default_value = "-")]
	input: String,

	/// Evaluate only this chunk
	#[arg(long)]
	chunk: Option<usize>,

	#[arg(long, default_value = "-")]
	output: String,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct StepArgs {
	/// Previous step's outcome JSON, `-` for stdin
	#[arg(long, default_value = "-")]
	input: String,

	#[arg(long, default_value = "-")]
	output: String,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct CleanupArgs {
	#[arg(long)]
	evaluation_id: String,

	#[arg(long, default_value = "-")]
	output: String,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct ListArgs {
	#[arg(long, default_value_t = 20)]
	limit: usize,

	/// Continuation token from a previous page
	#[arg(long)]
	token: Option<String>,

	/// Print JSON instead of a table
	#[arg(long, action = ArgAction::SetTrue)]
	json: bool,

	#[command(flatten)]
	overrides: OverrideArgs,
}

#[derive(Debug, Clone, Parser)]
struct ResultsArgs {
	evaluation_id: String,

	#[arg(long, default_value_t = 50)]
	limit: usize,

	#[arg(long)]
	token: Option<String>,

	#[arg(long, action = ArgAction::SetTrue)]
	json: bool,

	#[command(flatten)]
	overrides: OverrideArgs,
}

fn parse_strategy(s: &str) -> Result<ScoringStrategy, String> {
	ScoringStrategy::from_name(s).ok_or_else(|| format!("unknown strategy '{s}', expected standard or retrieval"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
	let cli = Cli::parse();
	init_logging(cli.verbose);

	let base = match &cli.config {
		Some(path) => PipelineConfig::from_path(path)?,
		None => PipelineConfig::default(),
	};

	let success = match cli.command {
		Commands::Run(args) => run(configure(base, &args.overrides)?, args).await?,
		Commands::Split(args) => split(configure_step(base, &args.overrides)?, args).await?,
		Commands::Evaluate(args) => evaluate(configure_step(base, &args.overrides)?, args).await?,
		Commands::Aggregate(args) => aggregate(configure_step(base, &args.overrides)?, args).await?,
		Commands::Persist(args) => persist(configure_step(base, &args.overrides)?, args).await?,
		Commands::Cleanup(args) => cleanup(configure_step(base, &args.overrides)?, args).await?,
		Commands::Summaries(args) => summaries(configure(base, &args.overrides)?, args).await?,
		Commands::Results(args) => results(configure(base, &args.overrides)?, args).await?,
	};

	Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_logging(verbose: bool) {
	let default = if verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
		)
		.with_writer(std::io::stderr)
		.init();
}

fn configure(mut config: PipelineConfig, overrides: &OverrideArgs) -> Result<PipelineConfig> {
	if let Some(url) = &overrides.chat_url {
		config.chat = Some(ChatConfig::Http { url: url.clone() });
	}
	if let Some(url) = &overrides.scoring_url {
		config.scoring = ScoringConfig::Http { url: url.clone() };
	}
	if let Some(strategy) = overrides.strategy {
		config.strategy = strategy;
	}
	if let Some(n) = overrides.chunk_size {
		config.chunk_size = n;
	}
	if let Some(n) = overrides.max_concurrency {
		config.max_concurrency = n;
	}
	if let Some(dir) = &overrides.artifacts_dir {
		config.artifacts = ArtifactConfig::Filesystem { root: dir.clone() };
	}
	if let Some(path) = &overrides.results_db {
		config.results_db = path.clone();
	}
	config.validate()?;
	Ok(config)
}

/// Step commands hand artifacts to the next invocation, so they need a
/// backend that outlives the process.
fn configure_step(base: PipelineConfig, overrides: &OverrideArgs) -> Result<PipelineConfig> {
	let config = configure(base, overrides)?;
	if matches!(config.artifacts, ArtifactConfig::Memory) {
		anyhow::bail!(
			"the memory artifact backend is dropped when the command exits; use `run` or a filesystem backend"
		);
	}
	Ok(config)
}

fn open_results(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
	if let Some(parent) = config.results_db.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)
			.with_context(|| format!("failed to create {}", parent.display()))?;
	}
	let store = SqliteStore::open(&config.results_db)
		.with_context(|| format!("failed to open results db {}", config.results_db.display()))?;
	Ok(Arc::new(store))
}

/// Copy a local test-case file into the artifact store under
/// `test-cases/<file name>` and return the key.
async fn upload_test_cases(store: &dyn ArtifactStore, path: &Path) -> Result<String> {
	let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
	let file_name = path
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| anyhow::anyhow!("invalid data file name: {}", path.display()))?;
	let key = format!("test-cases/{file_name}");
	store.put(&key, bytes).await?;
	info!(key = %key, "uploaded test cases");
	Ok(key)
}

fn cancel_on_ctrl_c() -> CancellationToken {
	let token = CancellationToken::new();
	let child = token.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("interrupted, cancelling in-flight test cases");
			child.cancel();
		}
	});
	token
}

async fn run(config: PipelineConfig, args: RunArgs) -> Result<bool> {
	let artifacts = config.artifact_store();
	let test_cases_key = upload_test_cases(artifacts.as_ref(), &args.data).await?;

	let pipeline = Pipeline::builder()
		.config(&config)
		.artifacts(artifacts)
		.chat(config.chat_client()?)
		.scoring(config.scoring_service()?)
		.results(open_results(&config)?)
		.cancellation(cancel_on_ctrl_c())
		.build()?;

	let request = SplitRequest {
		test_cases_key,
		evaluation_id: args.id,
		evaluation_name: args.name,
	};
	let outcome = pipeline.run(request).await;

	if let Some(path) = &args.json_out {
		let json = serde_json::to_string_pretty(&outcome)?;
		std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
	}

	match outcome {
		StepOutcome::Succeeded(report) => {
			println!("{}", report.summary.summary_table());
			for (chunk_index, error) in &report.failed_chunks {
				println!("chunk {chunk_index} failed: {error}");
			}
			if !report.cleanup.failures.is_empty() {
				println!("cleanup left {} prefixes behind", report.cleanup.failures.len());
			}
			Ok(true)
		}
		StepOutcome::Failed { evaluation_id, error } => {
			eprintln!(
				"evaluation {} failed: {error}",
				evaluation_id.as_deref().unwrap_or("(not started)")
			);
			Ok(false)
		}
	}
}

async fn split(config: PipelineConfig, args: SplitArgs) -> Result<bool> {
	let artifacts = config.artifact_store();
	let test_cases_key = match (&args.data, &args.key) {
		(Some(path), _) => upload_test_cases(artifacts.as_ref(), path).await?,
		(None, Some(key)) => key.clone(),
		(None, None) => anyhow::bail!("either --data or --key is required"),
	};
	let request = SplitRequest {
		test_cases_key,
		evaluation_id: args.id,
		evaluation_name: args.name,
	};
	let outcome = Splitter::new(artifacts, config.chunk_size).split(request).await;
	emit(&args.output, to_outcome(outcome))
}

/// Chunk outcomes of one `evaluate` invocation.
#[derive(Serialize)]
struct EvaluateOutput {
	evaluation_id: String,
	chunks: Vec<ChunkOutcome>,
}

async fn evaluate(config: PipelineConfig, args: EvaluateArgs) -> Result<bool> {
	let split: SplitOutput = match read_input(&args.input)? {
		StepOutcome::Succeeded(split) => split,
		StepOutcome::Failed { evaluation_id, error } => {
			return emit::<EvaluateOutput>(&args.output, StepOutcome::Failed { evaluation_id, error })
		}
	};

	let evaluator = Evaluator::new(
		config.artifact_store(),
		config.chat_client()?,
		config.scoring_service()?,
		config.evaluator_settings(),
	)
	.with_cancellation(cancel_on_ctrl_c());

	let chunks: Vec<_> = split
		.chunks
		.iter()
		.filter(|c| args.chunk.map_or(true, |i| c.chunk_index == i))
		.collect();
	if chunks.is_empty() {
		anyhow::bail!("no chunk matches the request");
	}

	let results: Vec<_> = stream::iter(chunks)
		.map(|chunk| evaluator.evaluate_chunk(chunk))
		.buffer_unordered(config.max_concurrency)
		.collect()
		.await;

	let mut outcomes = Vec::with_capacity(results.len());
	for result in results {
		match result {
			Ok(outcome) => outcomes.push(outcome),
			Err(e) => {
				let id = e.evaluation_id().map(str::to_string);
				return emit::<EvaluateOutput>(&args.output, StepOutcome::failed(id, e));
			}
		}
	}
	outcomes.sort_by_key(|o| o.chunk_index);
	emit(
		&args.output,
		StepOutcome::Succeeded(EvaluateOutput {
			evaluation_id: split.evaluation_id,
			chunks: outcomes,
		}),
	)
}

async fn aggregate(config: PipelineConfig, args: StepArgs) -> Result<bool> {
	let split: SplitOutput = match read_input(&args.input)? {
		StepOutcome::Succeeded(split) => split,
		StepOutcome::Failed { evaluation_id, error } => {
			return emit::<AggregatedSummary>(&args.output, StepOutcome::Failed { evaluation_id, error })
		}
	};
	let request = AggregateRequest::from_split(&split, config.strategy);
	let outcome = Aggregator::new(config.artifact_store(), config.min_success_ratio)
		.aggregate(&request)
		.await;
	emit(&args.output, to_outcome(outcome))
}

async fn persist(config: PipelineConfig, args: StepArgs) -> Result<bool> {
	let summary: AggregatedSummary = match read_input(&args.input)? {
		StepOutcome::Succeeded(summary) => summary,
		StepOutcome::Failed { evaluation_id, error } => {
			return emit::<evalflow_types::PersistOutput>(&args.output, StepOutcome::Failed { evaluation_id, error })
		}
	};
	let outcome = Persister::new(config.artifact_store(), open_results(&config)?)
		.persist(&summary)
		.await;
	emit(&args.output, to_outcome(outcome))
}

async fn cleanup(config: PipelineConfig, args: CleanupArgs) -> Result<bool> {
	let report = Cleanup::new(config.artifact_store()).run(&args.evaluation_id).await;
	emit(&args.output, StepOutcome::Succeeded(report))
}

#[derive(Tabled)]
struct SummaryRow {
	id: String,
	name: String,
	created: String,
	questions: usize,
	failed: usize,
	averages: String,
}

impl From<&SummaryRecord> for SummaryRow {
	fn from(r: &SummaryRecord) -> Self {
		Self {
			id: r.evaluation_id.clone(),
			name: r.evaluation_name.clone(),
			created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
			questions: r.total_questions,
			failed: r.failed_questions,
			averages: r
				.averages
				.iter()
				.map(|(m, v)| format!("{m}={v:.2}"))
				.collect::<Vec<_>>()
				.join(" "),
		}
	}
}

async fn summaries(config: PipelineConfig, args: ListArgs) -> Result<bool> {
	let store = open_results(&config)?;
	let page = store.list_summaries(args.limit, args.token.as_deref()).await?;
	if args.json {
		println!("{}", serde_json::to_string_pretty(&page)?);
	} else {
		println!("{}", Table::new(page.items.iter().map(SummaryRow::from)));
		if let Some(token) = &page.next_token {
			println!("more: --token {token}");
		}
	}
	Ok(true)
}

async fn results(config: PipelineConfig, args: ResultsArgs) -> Result<bool> {
	let store = open_results(&config)?;
	let Some(summary) = store.get_summary(&args.evaluation_id).await? else {
		eprintln!("evaluation {} not found", args.evaluation_id);
		return Ok(false);
	};
	let page = store
		.list_results(&args.evaluation_id, args.limit, args.token.as_deref())
		.await?;
	if args.json {
		println!(
			"{}",
			serde_json::to_string_pretty(&serde_json::json!({ "summary": summary, "results": page }))?
		);
	} else {
		let rows: Vec<DetailedResult> = page.items.into_iter().map(into_detailed).collect();
		println!("{} ({})", summary.evaluation_name, summary.evaluation_id);
		println!("{}", detail_table(&rows));
		if let Some(token) = &page.next_token {
			println!("more: --token {token}");
		}
	}
	Ok(true)
}

fn into_detailed(r: DetailRecord) -> DetailedResult {
	DetailedResult {
		question_index: r.question_index,
		question: r.question,
		expected_response: r.expected_response,
		actual_response: r.actual_response,
		status: r.status,
		scores: r.scores,
		error: r.error,
		retrieved_context: r.retrieved_context,
		sources: Vec::new(),
	}
}

fn to_outcome<T>(result: Result<T, evalflow_core::PipelineError>) -> StepOutcome<T> {
	match result {
		Ok(value) => StepOutcome::Succeeded(value),
		Err(e) => {
			let id = e.evaluation_id().map(str::to_string);
			StepOutcome::failed(id, e)
		}
	}
}

fn read_input<T: DeserializeOwned>(input: &str) -> Result<StepOutcome<T>> {
	let content = if input == "-" {
		let mut buf = String::new();
		std::io::stdin().read_to_string(&mut buf).context("failed to read stdin")?;
		buf
	} else {
		std::fs::read_to_string(input).with_context(|| format!("failed to read {input}"))?
	};
	serde_json::from_str(&content).with_context(|| format!("{input} is not a valid step outcome"))
}

/// Write `outcome` as JSON and report whether it succeeded.
fn emit<T: Serialize>(output: &str, outcome: StepOutcome<T>) -> Result<bool> {
	let json = serde_json::to_string_pretty(&outcome)?;
	if output == "-" {
		let mut stdout = std::io::stdout().lock();
		writeln!(stdout, "{json}")?;
	} else {
		std::fs::write(output, json).with_context(|| format!("failed to write {output}"))?;
	}
	if let StepOutcome::Failed { evaluation_id, error } = &outcome {
		warn!(evaluation_id = evaluation_id.as_deref().unwrap_or("-"), error = %error, "step failed");
	}
	Ok(outcome.is_success())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn overrides() -> OverrideArgs {
		OverrideArgs {
			chat_url: None,
			scoring_url: None,
			strategy: None,
			chunk_size: None,
			max_concurrency: None,
			artifacts_dir: None,
			results_db: None,
		}
	}

	#[test]
	fn test_step_commands_reject_memory_artifacts() {
		let memory = PipelineConfig {
			artifacts: ArtifactConfig::Memory,
			..PipelineConfig::default()
		};
		let err = configure_step(memory.clone(), &overrides()).unwrap_err();
		assert!(err.to_string().contains("memory artifact backend"));

		assert!(configure(memory.clone(), &overrides()).is_ok());

		let on_disk = OverrideArgs {
			artifacts_dir: Some(PathBuf::from("/tmp/evalflow")),
			..overrides()
		};
		assert!(configure_step(memory, &on_disk).is_ok());
	}

	#[test]
	fn test_flags_override_config() {
		let args = OverrideArgs {
			chat_url: Some("http://localhost:8080/chat".into()),
			strategy: Some(ScoringStrategy::Standard),
			chunk_size: Some(4),
			..overrides()
		};
		let config = configure(PipelineConfig::default(), &args).unwrap();
		assert_eq!(config.chunk_size, 4);
		assert_eq!(config.strategy, ScoringStrategy::Standard);
		assert!(matches!(config.chat, Some(ChatConfig::Http { ref url }) if url == "http://localhost:8080/chat"));
	}
}
