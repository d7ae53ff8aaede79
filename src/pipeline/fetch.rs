use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use crate::clients::ObjectStore;
use crate::models::{PipelineError, Result};

/// Per-batch download outcome. Objects listed in `failed` must be treated as
/// absent by the inference stage.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub succeeded: Vec<String>,
    pub failed: HashMap<String, String>,
    pub duration: Duration,
}

impl FetchReport {
    pub fn is_success(&self, object_name: &str) -> bool {
        !self.failed.contains_key(object_name)
    }
}

/// Materializes remote objects to local paths ahead of inference with a
/// bounded pool of concurrent downloads. The local directory structure
/// mirrors the object prefixes. Per-item failures are recorded, never raised:
/// the pipeline treats failed objects as absent.
pub struct Fetcher {
    store: Arc<dyn ObjectStore>,
    data_dir: PathBuf,
    workers: usize,
    item_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        data_dir: PathBuf,
        workers: usize,
        item_timeout: Duration,
    ) -> Self {
        Self {
            store,
            data_dir,
            workers: workers.max(1),
            item_timeout,
        }
    }

    /// Local destination for an object, under the fetcher's data directory.
    pub fn local_path(&self, object_name: &str) -> PathBuf {
        self.data_dir.join(object_name)
    }

    pub async fn fetch(&self, bucket: &str, object_names: &[String]) -> FetchReport {
        let start = Instant::now();

        let results: Vec<(String, std::result::Result<(), String>)> =
            stream::iter(object_names.iter().cloned())
                .map(|object_name| async move {
                    let outcome = self.fetch_one(bucket, &object_name).await;
                    (object_name, outcome.map_err(|e| e.to_string()))
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        let mut report = FetchReport::default();
        for (object_name, outcome) in results {
            match outcome {
                Ok(()) => report.succeeded.push(object_name),
                Err(reason) => {
                    tracing::warn!(object = %object_name, reason = %reason, "Fetch failed; treating object as absent");
                    report.failed.insert(object_name, reason);
                }
            }
        }
        report.duration = start.elapsed();

        tracing::info!(
            requested = object_names.len(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Fetch completed"
        );
        report
    }

    async fn fetch_one(&self, bucket: &str, object_name: &str) -> Result<()> {
        let dest = self.local_path(object_name);
        if let Some(parent) = dest.parent() {
            // Workers race on shared prefixes; create_dir_all tolerates that.
            tokio::fs::create_dir_all(parent).await?;
        }

        match timeout(self.item_timeout, self.store.get(bucket, object_name, &dest)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::FetchItem {
                object: object_name.to_string(),
                reason: format!("timed out after {}ms", self.item_timeout.as_millis()),
            }),
        }
    }
}
