use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tabled::{Table, Tabled};

/// A named quality metric produced by the scoring service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Similarity,
    Relevance,
    Correctness,
    ContextPrecision,
    ContextRecall,
    ResponseRelevancy,
    Faithfulness,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Similarity,
        Metric::Relevance,
        Metric::Correctness,
        Metric::ContextPrecision,
        Metric::ContextRecall,
        Metric::ResponseRelevancy,
        Metric::Faithfulness,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Similarity => "similarity",
            Self::Relevance => "relevance",
            Self::Correctness => "correctness",
            Self::ContextPrecision => "context_precision",
            Self::ContextRecall => "context_recall",
            Self::ResponseRelevancy => "response_relevancy",
            Self::Faithfulness => "faithfulness",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-metric values, ordered by metric for stable serialization.
pub type MetricScores = BTreeMap<Metric, f64>;

/// Selects which metric set a run computes.
///
/// - `Standard`: answer quality only (similarity, relevance, correctness)
/// - `Retrieval`: standard metrics plus the four retrieval-grounded metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategy {
    Standard,
    #[default]
    Retrieval,
}

impl ScoringStrategy {
    pub fn metrics(&self) -> &'static [Metric] {
        match self {
            Self::Standard => &Metric::ALL[..3],
            Self::Retrieval => &Metric::ALL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Retrieval => "retrieval",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "retrieval" | "rag" => Some(Self::Retrieval),
            _ => None,
        }
    }
}

/// One labeled question from the input set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub question: String,
    #[serde(alias = "expectedResponse", alias = "expected")]
    pub expected_response: String,
}

impl TestCase {
    pub fn new(question: impl Into<String>, expected_response: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            expected_response: expected_response.into(),
        }
    }
}

/// A document the chat system retrieved while answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Source {
    /// Title, or the last path segment of the uri when the title is blank.
    pub fn display_title(&self) -> &str {
        if !self.title.trim().is_empty() {
            return &self.title;
        }
        self.uri.rsplit('/').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Scored,
    Failed,
}

/// Outcome of evaluating one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedResult {
    /// Position of the case in the original test-case set.
    pub question_index: usize,
    pub question: String,
    pub expected_response: String,
    pub actual_response: String,
    pub status: CaseStatus,
    #[serde(default)]
    pub scores: MetricScores,
    /// Set on failed cases, and on scored cases where a metric fell back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
}

impl DetailedResult {
    pub fn is_scored(&self) -> bool {
        self.status == CaseStatus::Scored
    }
}

/// Durable output of one chunk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub evaluation_id: String,
    pub chunk_index: usize,
    pub detailed_results: Vec<DetailedResult>,
    pub sums: MetricScores,
    /// Number of scored cases; failed cases are not counted.
    pub num_test_cases: usize,
    #[serde(default)]
    pub num_failed: usize,
}

/// Where one chunk lives and which slice of the input it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub evaluation_id: String,
    pub chunk_index: usize,
    pub chunk_key: String,
    pub first_question_index: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOutput {
    pub evaluation_id: String,
    pub evaluation_name: String,
    pub test_cases_key: String,
    pub chunks: Vec<ChunkDescriptor>,
}

impl SplitOutput {
    pub fn total_cases(&self) -> usize {
        self.chunks.iter().map(|c| c.len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub evaluation_id: String,
    pub chunk_index: usize,
    pub partial_result_key: String,
    pub num_test_cases: usize,
    pub num_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSummary {
    pub evaluation_id: String,
    pub evaluation_name: String,
    pub test_cases_key: String,
    pub strategy: ScoringStrategy,
    pub averages: MetricScores,
    pub total_questions: usize,
    pub failed_questions: usize,
    pub chunks_read: usize,
    pub chunks_expected: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_chunks: Vec<usize>,
    pub detailed_results_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistOutput {
    pub evaluation_id: String,
    pub detail_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub prefix: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub evaluation_id: String,
    pub deleted: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CleanupFailure>,
}

/// Tagged result handed from one pipeline step to the next.
///
/// Serializes as `{"status": "succeeded", ...output}` or
/// `{"status": "failed", "evaluation_id": ..., "error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome<T> {
    Succeeded(T),
    Failed {
        evaluation_id: Option<String>,
        error: String,
    },
}

impl<T> StepOutcome<T> {
    pub fn failed(evaluation_id: Option<String>, error: impl fmt::Display) -> Self {
        Self::Failed {
            evaluation_id,
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn into_result(self) -> Result<T, (Option<String>, String)> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed {
                evaluation_id,
                error,
            } => Err((evaluation_id, error)),
        }
    }
}

#[derive(Debug, Clone, Tabled)]
struct MetricRow {
    metric: String,
    average: String,
}

#[derive(Debug, Clone, Tabled)]
struct DetailRow {
    index: usize,
    status: String,
    question: String,
    actual: String,
    scores: String,
}

impl AggregatedSummary {
    pub fn summary_table(&self) -> String {
        let rows: Vec<MetricRow> = self
            .strategy
            .metrics()
            .iter()
            .map(|m| MetricRow {
                metric: m.name().to_string(),
                average: self
                    .averages
                    .get(m)
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();

        let table = Table::new(rows).to_string();
        let mut footer = format!(
            "Evaluation: {} ({})\nQuestions scored: {}  Failed: {}  Chunks: {}/{}",
            self.evaluation_name,
            self.evaluation_id,
            self.total_questions,
            self.failed_questions,
            self.chunks_read,
            self.chunks_expected
        );
        if !self.skipped_chunks.is_empty() {
            footer.push_str(&format!("  Skipped chunks: {:?}", self.skipped_chunks));
        }

        format!("{}\n\n{}\n", table, footer)
    }
}

/// Render per-question results as a table, truncating long text.
pub fn detail_table(results: &[DetailedResult]) -> String {
    let rows: Vec<DetailRow> = results
        .iter()
        .map(|r| DetailRow {
            index: r.question_index,
            status: match r.status {
                CaseStatus::Scored => "✓".to_string(),
                CaseStatus::Failed => "✗".to_string(),
            },
            question: truncate(&r.question, 48),
            actual: truncate(r.error.as_deref().unwrap_or(&r.actual_response), 48),
            scores: r
                .scores
                .iter()
                .map(|(m, v)| format!("{}={:.2}", m, v))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect();

    Table::new(rows).to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
    truncated.push('…');
    truncated
}
