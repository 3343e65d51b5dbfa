use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::keys;
use evalflow_types::{CleanupFailure, CleanupReport};

/// Best-effort removal of an evaluation's intermediate artifacts.
pub struct Cleanup {
    store: Arc<dyn ArtifactStore>,
}

impl Cleanup {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Never fails: each prefix and key is attempted independently and
    /// anything that could not be deleted is listed in the report.
    pub async fn run(&self, evaluation_id: &str) -> CleanupReport {
        let mut report = CleanupReport {
            evaluation_id: evaluation_id.to_string(),
            ..CleanupReport::default()
        };
        if evaluation_id.trim().is_empty() {
            warn!("cleanup called without an evaluation id, nothing to do");
            return report;
        }

        for prefix in keys::intermediate_prefixes(evaluation_id) {
            let listed = match self.store.list(&prefix).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(evaluation_id, prefix = %prefix, error = %e, "failed to list artifacts");
                    report.failures.push(CleanupFailure {
                        prefix,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            for key in listed {
                match self.store.delete(&key).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        warn!(evaluation_id, key = %key, error = %e, "failed to delete artifact");
                        report.failures.push(CleanupFailure {
                            prefix: prefix.clone(),
                            error: format!("{key}: {e}"),
                        });
                    }
                }
            }
        }

        info!(
            evaluation_id,
            deleted = report.deleted,
            failures = report.failures.len(),
            "cleanup finished"
        );
        report
    }
}
