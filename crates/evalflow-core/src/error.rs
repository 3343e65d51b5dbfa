use std::time::Duration;

use thiserror::Error;

use crate::artifact::ArtifactError;

/// Errors that end a pipeline step.
///
/// Every variant raised after the split carries the evaluation id so the
/// caller can retry just the failing step.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unparseable, empty or incomplete test-case source. Raised before any
    /// chunk is written.
    #[error("invalid test case input: {0}")]
    Input(String),

    /// The test-case source could not be fetched. Unlike `Input`, the
    /// source itself may be fine.
    #[error("test case source '{key}' is unavailable: {source}")]
    SourceUnavailable {
        key: String,
        #[source]
        source: ArtifactError,
    },

    /// Chunks already exist for this evaluation with a different layout or
    /// different cases.
    #[error("evaluation {evaluation_id} already has a different split: {reason}")]
    SplitConflict { evaluation_id: String, reason: String },

    #[error("evaluation {evaluation_id}: chunk {chunk_index} could not be read: {reason}")]
    ChunkUnreadable {
        evaluation_id: String,
        chunk_index: usize,
        reason: String,
    },

    /// The run was cancelled. Written artifacts are kept for a resume.
    #[error("evaluation {evaluation_id}: cancelled")]
    Cancelled { evaluation_id: String },

    #[error("evaluation {evaluation_id}: no test cases were successfully evaluated")]
    ZeroSuccessfulCases { evaluation_id: String },

    #[error("evaluation {evaluation_id}: only {read} of {expected} chunk results were readable (minimum ratio {min_ratio})")]
    BelowSuccessThreshold {
        evaluation_id: String,
        read: usize,
        expected: usize,
        min_ratio: f64,
    },

    #[error("missing required field '{field}'")]
    MissingField {
        evaluation_id: Option<String>,
        field: &'static str,
    },

    #[error("evaluation {evaluation_id}: failed to persist results: {reason}")]
    Persistence {
        evaluation_id: String,
        reason: String,
    },

    #[error("evaluation {evaluation_id}: artifact store error: {source}")]
    Artifact {
        evaluation_id: String,
        #[source]
        source: ArtifactError,
    },
}

impl PipelineError {
    pub fn evaluation_id(&self) -> Option<&str> {
        match self {
            Self::Input(_) | Self::SourceUnavailable { .. } => None,
            Self::MissingField { evaluation_id, .. } => evaluation_id.as_deref(),
            Self::SplitConflict { evaluation_id, .. }
            | Self::ChunkUnreadable { evaluation_id, .. }
            | Self::Cancelled { evaluation_id }
            | Self::ZeroSuccessfulCases { evaluation_id }
            | Self::BelowSuccessThreshold { evaluation_id, .. }
            | Self::Persistence { evaluation_id, .. }
            | Self::Artifact { evaluation_id, .. } => Some(evaluation_id),
        }
    }

    /// Whether re-running the same step can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::ChunkUnreadable { .. }
                | Self::Persistence { .. }
                | Self::Artifact { .. }
        )
    }

    pub(crate) fn artifact(evaluation_id: &str, source: ArtifactError) -> Self {
        Self::Artifact {
            evaluation_id: evaluation_id.to_string(),
            source,
        }
    }
}

/// Why a single test case could not be scored. Recorded on the case, never
/// propagated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaseError {
    #[error("chat request timed out after {0:?}")]
    ChatTimeout(Duration),

    #[error("chat request failed: {0}")]
    Chat(String),

    #[error("chat returned an empty answer")]
    EmptyAnswer,

    #[error("scoring timed out after {0:?}")]
    ScoringTimeout(Duration),

    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("scoring returned no usable metrics: {0}")]
    MalformedScores(String),

    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_id_is_surfaced() {
        let err = PipelineError::Persistence {
            evaluation_id: "e1".into(),
            reason: "disk full".into(),
        };
        assert_eq!(err.evaluation_id(), Some("e1"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("e1"));

        let err = PipelineError::Input("empty".into());
        assert_eq!(err.evaluation_id(), None);
        assert!(!err.is_retryable());

        let err = PipelineError::Cancelled {
            evaluation_id: "e1".into(),
        };
        assert_eq!(err.evaluation_id(), Some("e1"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeouts_report_sub_second_durations() {
        assert_eq!(
            CaseError::ChatTimeout(Duration::from_millis(200)).to_string(),
            "chat request timed out after 200ms"
        );
        assert_eq!(
            CaseError::ScoringTimeout(Duration::from_secs(120)).to_string(),
            "scoring timed out after 120s"
        );
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        let err = PipelineError::ZeroSuccessfulCases {
            evaluation_id: "e1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "evaluation e1: no test cases were successfully evaluated"
        );
    }
}
