use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{fmt, EnvFilter};

use pollinator_pipeline::cli::{parse_command, print_usage, Command};
use pollinator_pipeline::clients::{connect_pool, run_migrations, S3ObjectStore};
use pollinator_pipeline::config::Config;
use pollinator_pipeline::models::InferenceConfig;
use pollinator_pipeline::pipeline::{PipelineEngine, RunOutcome};
use pollinator_pipeline::processing::YoloDetector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load this crate's .env regardless of current working directory, and override any pre-set envs
    let _ = dotenvy::from_filename_override(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));
    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive("info".parse().unwrap());
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .init();

    let cfg = Config::from_env();
    let args: Vec<String> = std::env::args().collect();
    let command = parse_command(&args);
    if command == Command::Help {
        print_usage();
        return Ok(());
    }

    tracing::info!(
        bucket = %cfg.bucket_name,
        batch_size = cfg.batch_size,
        allow_multiple_results = cfg.allow_multiple_results,
        "Loaded configuration"
    );

    let pool = connect_pool(&cfg).await?;

    // Run pending migrations on startup (optional via AUTO_MIGRATE)
    let auto_migrate = std::env::var("AUTO_MIGRATE").unwrap_or_else(|_| "true".to_string());
    if auto_migrate.to_lowercase() == "true" || command == Command::Migrate {
        run_migrations(&pool).await?;
    }
    if command == Command::Migrate {
        return Ok(());
    }

    let object_store = Arc::new(S3ObjectStore::new(&cfg).await?);
    let engine = Arc::new(PipelineEngine::new(pool, object_store, cfg.clone()));

    match command {
        Command::Scan { prefix } => {
            let registered = engine.scan_bucket(&prefix).await?;
            tracing::info!(registered, "Scan finished");
        }
        Command::Run => {
            let model_config = InferenceConfig::from_file(&cfg.model_config_path)?;
            let mut flower_model = YoloDetector::from_params(&model_config.flower)?;
            let mut pollinator_model = YoloDetector::from_params(&model_config.pollinator)?;

            install_stop_handler(engine.cancel_flag());
            match engine
                .run_batch(&model_config, &mut flower_model, &mut pollinator_model)
                .await?
            {
                RunOutcome::Completed(report) => {
                    tracing::info!(run_id = %report.run_id, "Run finished");
                }
                RunOutcome::NothingToDo => {
                    tracing::info!("Nothing to do for this configuration");
                }
                RunOutcome::Cancelled => {
                    tracing::warn!("Run was cancelled before commit");
                }
                RunOutcome::AlreadyRunning => {
                    tracing::warn!("Another run is already in progress");
                }
            }
        }
        Command::Serve => serve(engine, cfg).await?,
        Command::Migrate | Command::Help => unreachable!("handled above"),
    }

    Ok(())
}

fn install_stop_handler(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Stop requested; aborting between images");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

/// Daemon mode: re-run the batch pipeline on a cron schedule. Overlapping
/// fires are skipped by the engine's run guard.
async fn serve(engine: Arc<PipelineEngine>, cfg: Config) -> anyhow::Result<()> {
    let model_config = InferenceConfig::from_file(&cfg.model_config_path)?;
    let flower_model = Arc::new(tokio::sync::Mutex::new(YoloDetector::from_params(
        &model_config.flower,
    )?));
    let pollinator_model = Arc::new(tokio::sync::Mutex::new(YoloDetector::from_params(
        &model_config.pollinator,
    )?));

    let mut scheduler = JobScheduler::new().await?;
    let job_engine = engine.clone();
    let job = Job::new_async(cfg.schedule_cron.as_str(), move |_uuid, _l| {
        let engine = job_engine.clone();
        let model_config = model_config.clone();
        let flower_model = flower_model.clone();
        let pollinator_model = pollinator_model.clone();
        Box::pin(async move {
            let outcome = {
                let mut flower = flower_model.lock().await;
                let mut pollinator = pollinator_model.lock().await;
                engine
                    .run_batch(&model_config, &mut *flower, &mut *pollinator)
                    .await
            };
            match outcome {
                Ok(RunOutcome::AlreadyRunning) => {
                    tracing::debug!("Previous run still in progress; skipping schedule");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Scheduled run failed");
                }
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    tracing::info!(cron = %cfg.schedule_cron, "Pipeline scheduler started");

    tokio::signal::ctrl_c().await?;
    tracing::warn!("Stop requested; shutting down scheduler");
    engine.cancel_flag().store(true, Ordering::SeqCst);
    scheduler.shutdown().await?;
    Ok(())
}
