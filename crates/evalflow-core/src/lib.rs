//! evalflow-core: chunked, retry-safe evaluation pipeline for conversational AI.
//! Split a test-case set into chunks, evaluate chunks in parallel against a
//! chat system and a scoring service, aggregate, persist, clean up.
//! Each step can run on its own; [`Pipeline`] runs them all locally.

pub mod aggregator;
pub mod artifact;
pub mod chat;
pub mod cleanup;
pub mod config;
pub mod datasource;
pub mod error;
pub mod evaluator;
pub mod keys;
pub mod persister;
pub mod pipeline;
pub mod scoring;
pub mod splitter;
pub mod testing;

pub mod scorers {
    pub mod embedding;
    pub mod lexical;
    pub mod similarity;

    pub use embedding::{embedder_from_fn, Embedder, EmbeddingSimilarity};
    pub use lexical::LexicalSimilarity;
    pub use similarity::{SimilarityScoringService, TextSimilarity};
}

pub use aggregator::{AggregateRequest, Aggregator};
pub use artifact::{ArtifactError, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use chat::{ChatClient, ChatRequest, ChatResponse, HttpChatClient};
pub use cleanup::Cleanup;
pub use config::{ArtifactConfig, ChatConfig, PipelineConfig, RetryPolicy, ScoringConfig};
pub use datasource::{ArtifactDataSource, DataSource, TestCaseFormat, VecDataSource};
pub use error::{CaseError, PipelineError};
pub use evaluator::{Evaluator, EvaluatorSettings};
pub use persister::Persister;
pub use pipeline::{Pipeline, PipelineBuilder, RunReport};
pub use scoring::{HttpScoringService, RawScores, ScoreRequest, ScoringService};
pub use splitter::{SplitRequest, Splitter};
pub use tokio_util::sync::CancellationToken;
