use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::clients::{collect_object_paths, ObjectStore};
use crate::config::Config;
use crate::models::{FlowerRow, InferenceConfig, PersistedFlower, PipelineError, Result};
use crate::pipeline::fetch::Fetcher;
use crate::processing::detector::DetectionModel;
use crate::processing::inference::{BatchItem, InferencePipeline};
use crate::processing::resolve::CoordinateResolver;
use crate::storage::{Catalog, Checkpointer, Loader};

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub batch: usize,
    pub fetch_failures: usize,
    pub processed: usize,
    pub skipped: usize,
    pub flowers: usize,
    pub pollinators: usize,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    /// The checkpoint was empty: every cataloged image already has a result
    /// for this configuration. A clean termination, not a failure.
    NothingToDo,
    /// A stop request arrived mid-batch; nothing from this run was committed.
    Cancelled,
    /// Another run is still in progress (daemon overlap guard).
    AlreadyRunning,
}

struct ActiveRunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives one batch through the full pipeline:
/// checkpoint -> fetch -> config upsert -> inference -> result insert ->
/// flower insert -> coordinate resolution -> pollinator insert.
/// Data flows forward only; stages communicate through the identifiers the
/// loader returns.
pub struct PipelineEngine {
    object_store: Arc<dyn ObjectStore>,
    checkpointer: Checkpointer,
    loader: Loader,
    catalog: Catalog,
    fetcher: Fetcher,
    config: Config,
    cancel: Arc<AtomicBool>,
    run_active: Arc<AtomicBool>,
}

impl PipelineEngine {
    pub fn new(pool: PgPool, object_store: Arc<dyn ObjectStore>, config: Config) -> Self {
        let fetcher = Fetcher::new(
            object_store.clone(),
            PathBuf::from(&config.data_dir),
            config.fetch_workers,
            Duration::from_millis(config.fetch_timeout_ms),
        );
        Self {
            object_store,
            checkpointer: Checkpointer::new(pool.clone()),
            loader: Loader::new(pool.clone()),
            catalog: Catalog::new(pool),
            fetcher,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            run_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared stop flag. Setting it aborts the current run between images,
    /// before anything of that run is committed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Lists bucket objects under `prefix` carrying a configured image suffix
    /// and registers them in the `files` catalog.
    pub async fn scan_bucket(&self, prefix: &str) -> Result<u64> {
        let prefixes = vec![prefix.to_string()];
        let object_paths = collect_object_paths(
            self.object_store.as_ref(),
            &self.config.bucket_name,
            &prefixes,
            &self.config.image_suffixes,
        )
        .await?;
        tracing::info!(
            bucket = %self.config.bucket_name,
            prefix = %prefix,
            objects = object_paths.len(),
            "Bucket scan finished"
        );
        self.catalog.register_objects(&object_paths).await
    }

    pub async fn run_batch(
        &self,
        model_config: &InferenceConfig,
        flower_model: &mut dyn DetectionModel,
        pollinator_model: &mut dyn DetectionModel,
    ) -> Result<RunOutcome> {
        if self
            .run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(RunOutcome::AlreadyRunning);
        }
        let _guard = ActiveRunGuard {
            flag: self.run_active.clone(),
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let fingerprint = model_config.fingerprint()?;
        tracing::info!(
            run_id = %run_id,
            config_id = %model_config.config_id,
            config_fingerprint = %fingerprint,
            "Starting pipeline run"
        );

        // Checkpoint
        let batch = match self
            .checkpointer
            .get_batch(&model_config.config_id, self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(PipelineError::Exhausted) => {
                tracing::info!(
                    run_id = %run_id,
                    config_id = %model_config.config_id,
                    "No unprocessed images; nothing to do"
                );
                return Ok(RunOutcome::NothingToDo);
            }
            Err(e) => return Err(e),
        };

        // Fetch
        let object_names: Vec<String> = batch.iter().map(|r| r.object_name.clone()).collect();
        let fetch_report = self.fetcher.fetch(&self.config.bucket_name, &object_names).await;

        if self.cancel.load(Ordering::Relaxed) {
            tracing::warn!(run_id = %run_id, "Run cancelled after fetch; nothing committed");
            return Ok(RunOutcome::Cancelled);
        }

        // Configuration must be stored before results reference it.
        self.loader.upsert_config(model_config).await?;

        // Inference over the files that actually arrived.
        let items: Vec<BatchItem> = batch
            .iter()
            .filter(|record| fetch_report.is_success(&record.object_name))
            .map(|record| BatchItem {
                record: record.clone(),
                path: self.fetcher.local_path(&record.object_name),
            })
            .collect();

        let inference = InferencePipeline::new(self.cancel.clone());
        let output = inference.run(&items, flower_model, pollinator_model);

        if self.cancel.load(Ordering::Relaxed) {
            tracing::warn!(run_id = %run_id, "Run cancelled during inference; nothing committed");
            return Ok(RunOutcome::Cancelled);
        }

        // Results for the whole batch: fetch- and inference-failed images get
        // an (empty) result so they are not re-selected forever; their
        // detections are simply absent. Retrying them is an operator
        // decision.
        let file_ids: Vec<i64> = batch.iter().map(|r| r.file_id).collect();
        let result_ids = self
            .loader
            .insert_results(&file_ids, &model_config.config_id, self.config.allow_multiple_results)
            .await?;

        let result_by_object: std::collections::HashMap<&str, i64> = batch
            .iter()
            .zip(&result_ids)
            .filter_map(|(record, result_id)| {
                result_id.map(|id| (record.object_name.as_str(), id))
            })
            .collect();
        for (record, result_id) in batch.iter().zip(&result_ids) {
            if result_id.is_none() {
                tracing::warn!(
                    run_id = %run_id,
                    object = %record.object_name,
                    "Result already exists for this configuration; dropping its detections"
                );
            }
        }

        // Flowers
        let flower_drafts: Vec<_> = output
            .flower_drafts
            .into_iter()
            .filter(|draft| result_by_object.contains_key(draft.object_name.as_str()))
            .collect();
        let flower_rows: Vec<FlowerRow> = flower_drafts
            .iter()
            .map(|draft| FlowerRow::from_draft(draft, result_by_object[draft.object_name.as_str()]))
            .collect();

        let (flowers_inserted, pollinators_inserted) = if flower_rows.is_empty() {
            tracing::info!(run_id = %run_id, "No flowers or pollinators predicted");
            (0, 0)
        } else {
            let flower_ids = self.loader.insert_flowers(&flower_rows).await?;

            let persisted: Vec<PersistedFlower> = flower_drafts
                .iter()
                .zip(&flower_ids)
                .map(|(draft, &flower_id)| PersistedFlower {
                    flower_id,
                    result_id: result_by_object[draft.object_name.as_str()],
                    object_name: draft.object_name.clone(),
                    flower_box_id: draft.flower_box_id,
                    x0: draft.bbox.x0 as i32,
                    y0: draft.bbox.y0 as i32,
                })
                .collect();

            let pollinator_drafts: Vec<_> = output
                .pollinator_drafts
                .into_iter()
                .filter(|draft| result_by_object.contains_key(draft.object_name.as_str()))
                .collect();

            let resolver = CoordinateResolver::new(model_config.flower.margin);
            let resolved = resolver.resolve(&persisted, &pollinator_drafts);
            for object_name in &resolved.dropped_images {
                tracing::error!(
                    run_id = %run_id,
                    object = %object_name,
                    "Dropped pollinator rows after join failure"
                );
            }

            if !resolved.rows.is_empty() {
                self.loader.insert_pollinators(&resolved.rows).await?;
            }
            (flower_rows.len(), resolved.rows.len())
        };

        let report = RunReport {
            run_id,
            started_at,
            duration: start.elapsed(),
            batch: batch.len(),
            fetch_failures: fetch_report.failed.len(),
            processed: output.processed,
            skipped: output.skipped.len(),
            flowers: flowers_inserted,
            pollinators: pollinators_inserted,
        };
        tracing::info!(
            run_id = %report.run_id,
            batch = report.batch,
            fetch_failures = report.fetch_failures,
            processed = report.processed,
            skipped = report.skipped,
            flowers = report.flowers,
            pollinators = report.pollinators,
            duration_ms = report.duration.as_millis() as u64,
            "Pipeline run completed"
        );
        Ok(RunOutcome::Completed(report))
    }
}
