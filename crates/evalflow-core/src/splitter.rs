use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{read_json, write_json, ArtifactError, ArtifactStore};
use crate::datasource::{ArtifactDataSource, DataSource};
use crate::error::PipelineError;
use crate::keys;
use evalflow_types::{ChunkDescriptor, SplitOutput, TestCase};

pub const DEFAULT_CHUNK_SIZE: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    /// Artifact key of the test-case source.
    pub test_cases_key: String,
    /// Reuse an id to make a re-run overwrite the same chunks.
    #[serde(default)]
    pub evaluation_id: Option<String>,
    #[serde(default)]
    pub evaluation_name: Option<String>,
}

impl SplitRequest {
    pub fn new(test_cases_key: impl Into<String>) -> Self {
        Self {
            test_cases_key: test_cases_key.into(),
            ..Self::default()
        }
    }

    /// Fill in a fresh evaluation id when none is set. Retries of the same
    /// request then write under one id.
    pub fn with_resolved_id(mut self) -> Self {
        if self.evaluation_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            self.evaluation_id = Some(Uuid::new_v4().to_string());
        }
        self
    }
}

/// Partitions a test-case set into ordered chunks of at most `chunk_size`
/// and writes each chunk as its own artifact.
pub struct Splitter {
    store: Arc<dyn ArtifactStore>,
    chunk_size: usize,
}

impl Splitter {
    pub fn new(store: Arc<dyn ArtifactStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Load the source named by `request.test_cases_key` and split it.
    pub async fn split(&self, request: SplitRequest) -> Result<SplitOutput, PipelineError> {
        let source = ArtifactDataSource::new(self.store.clone(), request.test_cases_key.clone());
        self.split_from(&source, request).await
    }

    pub async fn split_from(
        &self,
        source: &dyn DataSource,
        request: SplitRequest,
    ) -> Result<SplitOutput, PipelineError> {
        let cases = source.load().await?;
        self.split_cases(request, cases).await
    }

    /// Split records that are already in memory.
    ///
    /// Nothing is written unless every record is valid.
    pub async fn split_cases(
        &self,
        request: SplitRequest,
        cases: Vec<TestCase>,
    ) -> Result<SplitOutput, PipelineError> {
        if cases.is_empty() {
            return Err(PipelineError::Input("no test cases found".to_string()));
        }
        if let Some(idx) = cases
            .iter()
            .position(|c| c.question.trim().is_empty() || c.expected_response.trim().is_empty())
        {
            return Err(PipelineError::Input(format!(
                "test case {idx}: question and expected response must be non-empty"
            )));
        }

        let request = request.with_resolved_id();
        let evaluation_id = request.evaluation_id.clone().unwrap_or_default();
        let evaluation_name = request
            .evaluation_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(default_evaluation_name);

        let parts: Vec<&[TestCase]> = cases.chunks(self.chunk_size).collect();
        let written = self.matching_chunks(&evaluation_id, &parts).await?;

        let mut chunks = Vec::with_capacity(parts.len());
        for (chunk_index, chunk) in parts.iter().enumerate() {
            let chunk_key = keys::chunk_key(&evaluation_id, chunk_index);
            if !written.contains(&chunk_index) {
                write_json(self.store.as_ref(), &chunk_key, *chunk)
                    .await
                    .map_err(|e| PipelineError::artifact(&evaluation_id, e))?;
                debug!(evaluation_id = %evaluation_id, chunk_index, len = chunk.len(), "wrote chunk");
            }
            chunks.push(ChunkDescriptor {
                evaluation_id: evaluation_id.clone(),
                chunk_index,
                chunk_key,
                first_question_index: chunk_index * self.chunk_size,
                len: chunk.len(),
            });
        }

        info!(
            evaluation_id = %evaluation_id,
            cases = cases.len(),
            chunks = chunks.len(),
            "split test cases"
        );

        Ok(SplitOutput {
            evaluation_id,
            evaluation_name,
            test_cases_key: request.test_cases_key,
            chunks,
        })
    }

    /// Indices of chunks already stored with exactly the cases of `parts`,
    /// left behind by an earlier attempt of the same split. A stored chunk
    /// that is out of range or holds other cases is a conflict; one that
    /// does not decode was torn mid-write and is rewritten.
    async fn matching_chunks(
        &self,
        evaluation_id: &str,
        parts: &[&[TestCase]],
    ) -> Result<Vec<usize>, PipelineError> {
        let mut existing: Vec<usize> = self
            .store
            .list(&keys::chunks_prefix(evaluation_id))
            .await
            .map_err(|e| PipelineError::artifact(evaluation_id, e))?
            .iter()
            .filter_map(|key| keys::parse_chunk_index(key))
            .collect();
        existing.sort_unstable();

        let conflict = |reason: String| PipelineError::SplitConflict {
            evaluation_id: evaluation_id.to_string(),
            reason,
        };
        let mut matching = Vec::with_capacity(existing.len());
        for chunk_index in existing {
            let Some(part) = parts.get(chunk_index) else {
                return Err(conflict(format!(
                    "chunk {chunk_index} exists but the new split has {} chunks",
                    parts.len()
                )));
            };
            let key = keys::chunk_key(evaluation_id, chunk_index);
            match read_json::<Vec<TestCase>>(self.store.as_ref(), &key).await {
                Ok(stored) if stored.as_slice() == *part => matching.push(chunk_index),
                Ok(stored) => {
                    return Err(conflict(format!(
                        "chunk {chunk_index} holds {} different test cases, new split has {}",
                        stored.len(),
                        part.len()
                    )))
                }
                Err(ArtifactError::Decode { .. }) => {
                    warn!(evaluation_id, chunk_index, "stored chunk is unreadable, rewriting");
                }
                Err(e) => return Err(PipelineError::artifact(evaluation_id, e)),
            }
        }
        if !matching.is_empty() {
            debug!(evaluation_id, reused = matching.len(), "resuming earlier split");
        }
        Ok(matching)
    }
}

fn default_evaluation_name() -> String {
    format!("Evaluation on {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
}
