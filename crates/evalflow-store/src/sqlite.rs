use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use evalflow_types::{Metric, MetricScores, ScoringStrategy};

use crate::{
    parse_status, parse_token, status_name, DetailRecord, Page, ResultsStore, StoreError,
    SummaryRecord,
};

const SUMMARY_BASE_COLUMNS: [&str; 8] = [
    "evaluation_id",
    "evaluation_name",
    "test_cases_key",
    "detailed_results_key",
    "strategy",
    "total_questions",
    "failed_questions",
    "created_at",
];

const DETAIL_COLUMNS: &str = "evaluation_id, question_index, question, expected_response, \
     actual_response, status, scores, error, retrieved_context";

/// SQLite-backed [`ResultsStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path, e.g. "evalflow.db".
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn average_column(metric: Metric) -> String {
    format!("average_{}", metric.name())
}

fn summary_columns() -> Vec<String> {
    SUMMARY_BASE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(Metric::ALL.iter().map(|m| average_column(*m)))
        .collect()
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let averages = Metric::ALL
        .iter()
        .map(|m| format!("{} REAL", average_column(*m)))
        .collect::<Vec<_>>()
        .join(",\n                ");

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS evaluation_summaries (
                evaluation_id TEXT PRIMARY KEY,
                evaluation_name TEXT NOT NULL,
                test_cases_key TEXT NOT NULL,
                detailed_results_key TEXT NOT NULL,
                strategy TEXT NOT NULL,
                total_questions INTEGER NOT NULL,
                failed_questions INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                {averages}
            );

            CREATE TABLE IF NOT EXISTS evaluation_results (
                evaluation_id TEXT NOT NULL,
                question_index INTEGER NOT NULL,
                question TEXT NOT NULL,
                expected_response TEXT NOT NULL,
                actual_response TEXT NOT NULL,
                status TEXT NOT NULL,
                scores TEXT NOT NULL,
                error TEXT,
                retrieved_context TEXT,
                PRIMARY KEY (evaluation_id, question_index)
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_created
                ON evaluation_summaries (created_at DESC);"
    ))?;

    Ok(())
}

fn upsert_summary_sql() -> String {
    let columns = summary_columns();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|c| *c != "evaluation_id" && *c != "created_at")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO evaluation_summaries ({}) VALUES ({}) \
         ON CONFLICT(evaluation_id) DO UPDATE SET {}",
        columns.join(", "),
        placeholders,
        updates
    )
}

const UPSERT_DETAIL_SQL: &str = "INSERT INTO evaluation_results \
     (evaluation_id, question_index, question, expected_response, actual_response, status, scores, error, retrieved_context) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT(evaluation_id, question_index) DO UPDATE SET \
     question = excluded.question, \
     expected_response = excluded.expected_response, \
     actual_response = excluded.actual_response, \
     status = excluded.status, \
     scores = excluded.scores, \
     error = excluded.error, \
     retrieved_context = excluded.retrieved_context";

fn summary_values(summary: &SummaryRecord) -> Vec<Value> {
    let mut values = vec![
        Value::Text(summary.evaluation_id.clone()),
        Value::Text(summary.evaluation_name.clone()),
        Value::Text(summary.test_cases_key.clone()),
        Value::Text(summary.detailed_results_key.clone()),
        Value::Text(summary.strategy.name().to_string()),
        Value::Integer(summary.total_questions as i64),
        Value::Integer(summary.failed_questions as i64),
        Value::Text(summary.created_at.to_rfc3339()),
    ];
    for metric in Metric::ALL {
        values.push(match summary.averages.get(&metric) {
            Some(v) => Value::Real(*v),
            None => Value::Null,
        });
    }
    values
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
    let strategy: String = row.get(4)?;
    let strategy = ScoringStrategy::from_name(&strategy)
        .ok_or_else(|| conversion_error(4, format!("unknown strategy '{strategy}'")))?;
    let created_at: String = row.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| conversion_error(7, e))?
        .with_timezone(&Utc);

    let mut averages = MetricScores::new();
    for (offset, metric) in Metric::ALL.iter().enumerate() {
        if let Some(v) = row.get::<_, Option<f64>>(SUMMARY_BASE_COLUMNS.len() + offset)? {
            averages.insert(*metric, v);
        }
    }

    Ok(SummaryRecord {
        evaluation_id: row.get(0)?,
        evaluation_name: row.get(1)?,
        test_cases_key: row.get(2)?,
        detailed_results_key: row.get(3)?,
        strategy,
        averages,
        total_questions: row.get::<_, i64>(5)? as usize,
        failed_questions: row.get::<_, i64>(6)? as usize,
        created_at,
    })
}

fn detail_from_row(row: &Row<'_>) -> rusqlite::Result<DetailRecord> {
    let status: String = row.get(5)?;
    let status =
        parse_status(&status).ok_or_else(|| conversion_error(5, format!("unknown status '{status}'")))?;
    let scores: String = row.get(6)?;
    let scores: MetricScores = serde_json::from_str(&scores).map_err(|e| conversion_error(6, e))?;

    Ok(DetailRecord {
        evaluation_id: row.get(0)?,
        question_index: row.get::<_, i64>(1)? as usize,
        question: row.get(2)?,
        expected_response: row.get(3)?,
        actual_response: row.get(4)?,
        status,
        scores,
        error: row.get(7)?,
        retrieved_context: row.get(8)?,
    })
}

fn into_page<T>(mut items: Vec<T>, offset: usize, limit: usize) -> Page<T> {
    let next_token = if items.len() > limit {
        items.truncate(limit);
        Some((offset + limit).to_string())
    } else {
        None
    };
    Page { items, next_token }
}

#[async_trait]
impl ResultsStore for SqliteStore {
    async fn upsert_evaluation(
        &self,
        summary: &SummaryRecord,
        details: &[DetailRecord],
    ) -> Result<(), StoreError> {
        let summary = summary.clone();
        let details = details.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                &upsert_summary_sql(),
                params_from_iter(summary_values(&summary).iter()),
            )?;

            {
                let mut stmt = tx.prepare(UPSERT_DETAIL_SQL)?;
                for detail in &details {
                    stmt.execute(params![
                        detail.evaluation_id,
                        detail.question_index as i64,
                        detail.question,
                        detail.expected_response,
                        detail.actual_response,
                        status_name(detail.status),
                        serde_json::to_string(&detail.scores)?,
                        detail.error,
                        detail.retrieved_context,
                    ])?;
                }
            }

            let kept: Vec<usize> = details.iter().map(|d| d.question_index).collect();
            let removed = tx.execute(
                "DELETE FROM evaluation_results
                 WHERE evaluation_id = ?1
                   AND question_index NOT IN (SELECT value FROM json_each(?2))",
                params![summary.evaluation_id, serde_json::to_string(&kept)?],
            )?;
            if removed > 0 {
                tracing::debug!(
                    evaluation_id = %summary.evaluation_id,
                    removed,
                    "removed stale detail rows"
                );
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_summary(&self, evaluation_id: &str) -> Result<Option<SummaryRecord>, StoreError> {
        let evaluation_id = evaluation_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM evaluation_summaries WHERE evaluation_id = ?1",
                summary_columns().join(", ")
            );
            Ok(conn
                .query_row(&sql, params![evaluation_id], summary_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_summaries(
        &self,
        limit: usize,
        token: Option<&str>,
    ) -> Result<Page<SummaryRecord>, StoreError> {
        let offset = parse_token(token)?;
        let limit = limit.max(1);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM evaluation_summaries
                 ORDER BY created_at DESC, evaluation_id DESC
                 LIMIT ?1 OFFSET ?2",
                summary_columns().join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(
                    params![(limit + 1) as i64, offset as i64],
                    summary_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(into_page(items, offset, limit))
        })
        .await
    }

    async fn list_results(
        &self,
        evaluation_id: &str,
        limit: usize,
        token: Option<&str>,
    ) -> Result<Page<DetailRecord>, StoreError> {
        let offset = parse_token(token)?;
        let limit = limit.max(1);
        let evaluation_id = evaluation_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {DETAIL_COLUMNS} FROM evaluation_results
                 WHERE evaluation_id = ?1
                 ORDER BY question_index ASC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(
                    params![evaluation_id, (limit + 1) as i64, offset as i64],
                    detail_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(into_page(items, offset, limit))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evalflow_types::CaseStatus;

    fn summary(id: &str, created_secs: i64) -> SummaryRecord {
        let mut averages = MetricScores::new();
        averages.insert(Metric::Similarity, 0.8);
        averages.insert(Metric::Relevance, 0.6);
        averages.insert(Metric::Correctness, 0.7);
        SummaryRecord {
            evaluation_id: id.to_string(),
            evaluation_name: format!("eval {id}"),
            test_cases_key: "test-cases/set.json".to_string(),
            detailed_results_key: format!("evaluations/{id}/aggregated_results/detailed_results.json"),
            strategy: ScoringStrategy::Standard,
            averages,
            total_questions: 2,
            failed_questions: 0,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    fn detail(id: &str, index: usize) -> DetailRecord {
        let mut scores = MetricScores::new();
        scores.insert(Metric::Similarity, 0.8);
        DetailRecord {
            evaluation_id: id.to_string(),
            question_index: index,
            question: format!("question {index}"),
            expected_response: "expected".to_string(),
            actual_response: "actual".to_string(),
            status: CaseStatus::Scored,
            scores,
            error: None,
            retrieved_context: Some("context".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = summary("e1", 1_700_000_000);
        let details = vec![detail("e1", 0), detail("e1", 1)];

        store.upsert_evaluation(&s, &details).await.unwrap();
        store.upsert_evaluation(&s, &details).await.unwrap();

        let page = store.list_summaries(10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0], s);

        let results = store.list_results("e1", 10, None).await.unwrap();
        assert_eq!(results.items, details);
        assert!(results.next_token.is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at_and_drops_stale_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = summary("e1", 1_700_000_000);
        store
            .upsert_evaluation(&first, &[detail("e1", 0), detail("e1", 1), detail("e1", 2)])
            .await
            .unwrap();

        let mut second = summary("e1", 1_800_000_000);
        second.total_questions = 1;
        store
            .upsert_evaluation(&second, &[detail("e1", 1)])
            .await
            .unwrap();

        let stored = store.get_summary("e1").await.unwrap().unwrap();
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.total_questions, 1);

        let results = store.list_results("e1", 10, None).await.unwrap();
        assert_eq!(results.items.len(), 1);
        assert_eq!(results.items[0].question_index, 1);
    }

    #[tokio::test]
    async fn test_summaries_newest_first_with_pagination() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store
                .upsert_evaluation(&summary(id, 1_700_000_000 + i as i64), &[])
                .await
                .unwrap();
        }

        let first = store.list_summaries(2, None).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|s| s.evaluation_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = store
            .list_summaries(2, first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].evaluation_id, "a");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_results_are_scoped_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_evaluation(&summary("e1", 1), &[detail("e1", 2), detail("e1", 0)])
            .await
            .unwrap();
        store
            .upsert_evaluation(&summary("e2", 2), &[detail("e2", 0)])
            .await
            .unwrap();

        let page = store.list_results("e1", 10, None).await.unwrap();
        let indices: Vec<_> = page.items.iter().map(|d| d.question_index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(store.get_summary("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert_evaluation(&summary("e1", 1), &[detail("e1", 0)])
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_summary("e1").await.unwrap().is_some());
    }
}
