use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::error::PipelineError;
use evalflow_types::TestCase;

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Vec<TestCase>, PipelineError>;
}

pub struct VecDataSource {
    cases: Vec<TestCase>,
}

impl VecDataSource {
    pub fn new(cases: Vec<TestCase>) -> Self {
        Self { cases }
    }
}

#[async_trait]
impl DataSource for VecDataSource {
    async fn load(&self) -> Result<Vec<TestCase>, PipelineError> {
        Ok(self.cases.clone())
    }
}

/// Reads a test-case blob from the artifact store; the key's extension
/// selects the format.
pub struct ArtifactDataSource {
    store: Arc<dyn ArtifactStore>,
    key: String,
}

impl ArtifactDataSource {
    pub fn new(store: Arc<dyn ArtifactStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl DataSource for ArtifactDataSource {
    async fn load(&self) -> Result<Vec<TestCase>, PipelineError> {
        let format = TestCaseFormat::from_key(&self.key)?;
        let bytes = match self.store.get(&self.key).await {
            Ok(bytes) => bytes,
            Err(ArtifactError::NotFound(key)) => {
                return Err(PipelineError::Input(format!("test case source '{key}' not found")))
            }
            Err(source) => {
                return Err(PipelineError::SourceUnavailable {
                    key: self.key.clone(),
                    source,
                })
            }
        };
        parse_test_cases(&bytes, format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCaseFormat {
    /// An array of cases, or an object with a `test_cases` array.
    Json,
    /// One case object per line.
    Jsonl,
    /// `question` and `expectedResponse` columns, or exactly two columns.
    Csv,
}

impl TestCaseFormat {
    pub fn from_key(key: &str) -> Result<Self, PipelineError> {
        let ext = key
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "csv" => Ok(Self::Csv),
            _ => Err(PipelineError::Input(format!(
                "unsupported file type '{ext}' for '{key}'; expected json, jsonl or csv"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    #[serde(default)]
    question: Option<String>,
    #[serde(default, alias = "expectedResponse", alias = "expected")]
    expected_response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonSource {
    Cases(Vec<RawTestCase>),
    Wrapped { test_cases: Vec<RawTestCase> },
}

/// Parse and validate a whole test-case source.
///
/// Fails if the source is unparseable, empty, or any record lacks a
/// non-empty question or expected response.
pub fn parse_test_cases(bytes: &[u8], format: TestCaseFormat) -> Result<Vec<TestCase>, PipelineError> {
    let content = std::str::from_utf8(bytes)
        .map_err(|e| PipelineError::Input(format!("test cases are not valid UTF-8: {e}")))?;
    let content = content.trim_start_matches('\u{feff}');

    let raw = match format {
        TestCaseFormat::Json => parse_json(content)?,
        TestCaseFormat::Jsonl => parse_jsonl(content)?,
        TestCaseFormat::Csv => parse_csv(content)?,
    };

    if raw.is_empty() {
        return Err(PipelineError::Input("no test cases found".to_string()));
    }

    raw.into_iter()
        .enumerate()
        .map(|(idx, case)| validate(idx, case))
        .collect()
}

fn validate(idx: usize, case: RawTestCase) -> Result<TestCase, PipelineError> {
    let question = case
        .question
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| PipelineError::Input(format!("test case {idx}: missing 'question'")))?;
    let expected_response = case
        .expected_response
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| {
            PipelineError::Input(format!("test case {idx}: missing 'expectedResponse'"))
        })?;
    Ok(TestCase {
        question,
        expected_response,
    })
}

fn parse_json(content: &str) -> Result<Vec<RawTestCase>, PipelineError> {
    match serde_json::from_str::<JsonSource>(content) {
        Ok(JsonSource::Cases(cases)) | Ok(JsonSource::Wrapped { test_cases: cases }) => Ok(cases),
        Err(e) => Err(PipelineError::Input(format!(
            "JSON must be an array of test cases or an object with a 'test_cases' array: {e}"
        ))),
    }
}

fn parse_jsonl(content: &str) -> Result<Vec<RawTestCase>, PipelineError> {
    let mut cases = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| PipelineError::Input(format!("invalid JSON on line {}: {e}", idx + 1)))?;
        if !value.is_object() {
            return Err(PipelineError::Input(format!("line {}: expected object", idx + 1)));
        }
        let case = serde_json::from_value(value)
            .map_err(|e| PipelineError::Input(format!("line {}: {e}", idx + 1)))?;
        cases.push(case);
    }
    Ok(cases)
}

fn parse_csv(content: &str) -> Result<Vec<RawTestCase>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Input(format!("invalid CSV header: {e}")))?
        .clone();
    if headers.is_empty() {
        return Err(PipelineError::Input("CSV file has no headers".to_string()));
    }

    let position = |names: &[&str]| headers.iter().position(|h| names.contains(&h.trim()));
    let (q_col, a_col) = match (
        position(&["question"]),
        position(&["expectedResponse", "expected_response"]),
    ) {
        (Some(q), Some(a)) => (q, a),
        // Two unnamed columns are read positionally.
        _ if headers.len() == 2 => (0, 1),
        _ => {
            return Err(PipelineError::Input(
                "CSV must have 'question' and 'expectedResponse' columns".to_string(),
            ))
        }
    };

    let mut cases = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| PipelineError::Input(format!("invalid CSV row {}: {e}", idx + 1)))?;
        cases.push(RawTestCase {
            question: record.get(q_col).map(str::to_string),
            expected_response: record.get(a_col).map(str::to_string),
        });
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::testing::FlakyArtifactStore;

    #[test]
    fn test_json_array_and_wrapped() {
        let array = br#"[{"question": "q1", "expectedResponse": "a1"}, {"question": "q2", "expected_response": "a2"}]"#;
        let cases = parse_test_cases(array, TestCaseFormat::Json).unwrap();
        assert_eq!(cases, vec![TestCase::new("q1", "a1"), TestCase::new("q2", "a2")]);

        let wrapped = br#"{"test_cases": [{"question": "q1", "expected": "a1"}]}"#;
        let cases = parse_test_cases(wrapped, TestCaseFormat::Json).unwrap();
        assert_eq!(cases, vec![TestCase::new("q1", "a1")]);
    }

    #[test]
    fn test_json_rejects_missing_fields() {
        let bytes = br#"[{"question": "q1", "expectedResponse": "a1"}, {"question": "q2"}]"#;
        let err = parse_test_cases(bytes, TestCaseFormat::Json).unwrap_err();
        assert!(matches!(err, PipelineError::Input(msg) if msg.contains("test case 1")));
    }

    #[test]
    fn test_empty_and_corrupt_sources() {
        assert!(matches!(
            parse_test_cases(b"[]", TestCaseFormat::Json),
            Err(PipelineError::Input(_))
        ));
        assert!(matches!(
            parse_test_cases(b"{\"nope\": 1}", TestCaseFormat::Json),
            Err(PipelineError::Input(_))
        ));
        assert!(matches!(
            parse_test_cases(b"[{\"question\": ", TestCaseFormat::Json),
            Err(PipelineError::Input(_))
        ));
    }

    #[test]
    fn test_jsonl() {
        let bytes = b"{\"question\": \"q1\", \"expectedResponse\": \"a1\"}\n\n{\"question\": \"q2\", \"expectedResponse\": \"a2\"}\n";
        let cases = parse_test_cases(bytes, TestCaseFormat::Jsonl).unwrap();
        assert_eq!(cases.len(), 2);

        let err = parse_test_cases(b"[1]\n", TestCaseFormat::Jsonl).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_csv_with_headers_and_bom() {
        let bytes = "\u{feff}question,expectedResponse\n\"What, exactly?\",Yes\nq2,a2\n";
        let cases = parse_test_cases(bytes.as_bytes(), TestCaseFormat::Csv).unwrap();
        assert_eq!(
            cases,
            vec![TestCase::new("What, exactly?", "Yes"), TestCase::new("q2", "a2")]
        );
    }

    #[test]
    fn test_csv_two_unnamed_columns() {
        let bytes = b"Prompt,Answer\nq1,a1\n";
        let cases = parse_test_cases(bytes, TestCaseFormat::Csv).unwrap();
        assert_eq!(cases, vec![TestCase::new("q1", "a1")]);
    }

    #[test]
    fn test_csv_rejects_blank_answer_and_unknown_columns() {
        let err = parse_test_cases(b"question,expectedResponse\nq1,\n", TestCaseFormat::Csv).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));

        let err = parse_test_cases(b"a,b,c\n1,2,3\n", TestCaseFormat::Csv).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
    }

    #[test]
    fn test_format_from_key() {
        assert_eq!(TestCaseFormat::from_key("sets/a.JSON").unwrap(), TestCaseFormat::Json);
        assert_eq!(TestCaseFormat::from_key("a.jsonl").unwrap(), TestCaseFormat::Jsonl);
        assert_eq!(TestCaseFormat::from_key("a.csv").unwrap(), TestCaseFormat::Csv);
        assert!(TestCaseFormat::from_key("a.xlsx").is_err());
    }

    #[tokio::test]
    async fn test_artifact_source_missing_key_is_input_error() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let source = ArtifactDataSource::new(store.clone(), "test-cases/missing.json");
        assert!(matches!(source.load().await, Err(PipelineError::Input(_))));

        store
            .put("test-cases/set.csv", b"question,expectedResponse\nq,a\n".to_vec())
            .await
            .unwrap();
        let cases = ArtifactDataSource::new(store, "test-cases/set.csv").load().await.unwrap();
        assert_eq!(cases, vec![TestCase::new("q", "a")]);
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let inner: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        inner
            .put("test-cases/set.json", br#"[{"question": "q", "expectedResponse": "a"}]"#.to_vec())
            .await
            .unwrap();
        let flaky: Arc<dyn ArtifactStore> = Arc::new(FlakyArtifactStore::new(inner, vec!["test-cases/".into()]));

        let err = ArtifactDataSource::new(flaky, "test-cases/set.json").load().await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { ref key, .. } if key == "test-cases/set.json"));
        assert!(err.is_retryable());
        assert_eq!(err.evaluation_id(), None);
    }
}
