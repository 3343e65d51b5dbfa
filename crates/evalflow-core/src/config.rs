use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::chat::{ChatClient, HttpChatClient};
use crate::evaluator::EvaluatorSettings;
use crate::scorers::{LexicalSimilarity, SimilarityScoringService};
use crate::scoring::{HttpScoringService, ScoringService};
use evalflow_types::ScoringStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Required by the evaluate step only.
    #[serde(default)]
    pub chat: Option<ChatConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default = "default_results_db")]
    pub results_db: PathBuf,
    #[serde(default)]
    pub strategy: ScoringStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_case_concurrency")]
    pub case_concurrency: usize,
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_scoring_timeout_secs")]
    pub scoring_timeout_secs: u64,
    #[serde(default = "default_scoring_retries")]
    pub scoring_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_fallback_score")]
    pub fallback_score: f64,
    #[serde(default)]
    pub min_success_ratio: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_results_db() -> PathBuf {
    PathBuf::from(".evalflow/results.db")
}

fn default_chunk_size() -> usize {
    crate::splitter::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrency() -> usize {
    5
}

fn default_case_concurrency() -> usize {
    1
}

fn default_chat_timeout_secs() -> u64 {
    60
}

fn default_scoring_timeout_secs() -> u64 {
    120
}

fn default_scoring_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_fallback_score() -> f64 {
    0.5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chat: None,
            scoring: ScoringConfig::default(),
            artifacts: ArtifactConfig::default(),
            results_db: default_results_db(),
            strategy: ScoringStrategy::default(),
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            case_concurrency: default_case_concurrency(),
            chat_timeout_secs: default_chat_timeout_secs(),
            scoring_timeout_secs: default_scoring_timeout_secs(),
            scoring_retries: default_scoring_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_score: default_fallback_score(),
            min_success_ratio: 0.0,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ChatConfig {
    Http { url: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ScoringConfig {
    Http {
        url: String,
    },
    /// Offline scoring with character-level similarity.
    #[default]
    Lexical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactConfig {
    Filesystem { root: PathBuf },
    Memory,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self::Filesystem {
            root: PathBuf::from(".evalflow/artifacts"),
        }
    }
}

/// Retry policy for whole pipeline steps. Attempt `n` waits
/// `n * backoff_ms` before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

impl PipelineConfig {
    /// Load from YAML, or JSON when the file ends in `.json`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: Self = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse JSON config {}", path.display()))?
        } else {
            Self::from_yaml_str(&content)
                .with_context(|| format!("failed to parse YAML config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.max_concurrency == 0 || self.case_concurrency == 0 {
            bail!("max_concurrency and case_concurrency must be at least 1");
        }
        if self.chat_timeout_secs == 0 || self.scoring_timeout_secs == 0 {
            bail!("timeouts must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.fallback_score) {
            bail!("fallback_score {} must be within [0, 1]", self.fallback_score);
        }
        if !(0.0..=1.0).contains(&self.min_success_ratio) {
            bail!(
                "min_success_ratio {} must be within [0, 1]",
                self.min_success_ratio
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn evaluator_settings(&self) -> EvaluatorSettings {
        EvaluatorSettings {
            strategy: self.strategy,
            chat_timeout: Duration::from_secs(self.chat_timeout_secs),
            scoring_timeout: Duration::from_secs(self.scoring_timeout_secs),
            scoring_retries: self.scoring_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            fallback_score: self.fallback_score,
            case_concurrency: self.case_concurrency,
        }
    }

    pub fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        match &self.artifacts {
            ArtifactConfig::Filesystem { root } => Arc::new(FsArtifactStore::new(root.clone())),
            ArtifactConfig::Memory => Arc::new(MemoryArtifactStore::new()),
        }
    }

    pub fn chat_client(&self) -> Result<Arc<dyn ChatClient>> {
        match &self.chat {
            Some(ChatConfig::Http { url }) => Ok(Arc::new(HttpChatClient::new(
                url.clone(),
                Duration::from_secs(self.chat_timeout_secs),
            )?)),
            None => bail!("no chat endpoint configured; set `chat` in the config or pass --chat-url"),
        }
    }

    pub fn scoring_service(&self) -> Result<Arc<dyn ScoringService>> {
        Ok(match &self.scoring {
            ScoringConfig::Http { url } => Arc::new(HttpScoringService::new(
                url.clone(),
                Duration::from_secs(self.scoring_timeout_secs),
            )?),
            ScoringConfig::Lexical => {
                Arc::new(SimilarityScoringService::new(LexicalSimilarity::new()))
            }
        })
    }
}
