use analytics::jobs::{SqliteFeed, SqliteRegistry, WalletLocks};
use analytics::{cli, jobs, metrics, scheduler};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("wallet-analytics", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!("wallet-analytics starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Inspection and staging commands use the sync Database and exit immediately.
    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    if cmd != cli::Command::Run && !cmd.is_job() {
        let mut db = common::db::Database::open(&config.database.path)?;
        db.run_migrations()?;
        cli::run_command(&mut db, &config, cmd)?;
        return Ok(());
    }

    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let cfg = Arc::new(config);

    if cmd.is_job() {
        return cli::run_job_command(&db, cfg, cmd).await;
    }

    metrics::install_prometheus(cfg.observability.prometheus_port)?;
    metrics::describe();

    let feed = SqliteFeed::new(db.clone());
    let registry = SqliteRegistry::new(db.clone());
    let locks = WalletLocks::new();

    // Capacity 1: a tick arriving while a run is queued is dropped by the scheduler.
    let (pipeline_tx, mut pipeline_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (retention_tx, mut retention_rx) = tokio::sync::mpsc::channel::<()>(1);

    let scheduler_jobs = vec![
        scheduler::JobSpec {
            name: jobs::WALLET_PIPELINE_JOB.to_string(),
            interval: Duration::from_secs(cfg.batch.refresh_interval_secs),
            run_immediately: true,
            tick: pipeline_tx,
        },
        scheduler::JobSpec {
            name: jobs::COHORT_RETENTION_JOB.to_string(),
            interval: Duration::from_secs(cfg.cohorts.refresh_interval_secs),
            run_immediately: true,
            tick: retention_tx,
        },
    ];

    tokio::spawn({
        let db = db.clone();
        let cfg = cfg.clone();
        async move {
            while pipeline_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = jobs::WALLET_PIPELINE_JOB);
                let res = jobs::run_wallet_pipeline_once(
                    &db,
                    &feed,
                    &registry,
                    &locks,
                    cfg.clone(),
                    chrono::Utc::now(),
                )
                .instrument(span)
                .await;
                match res {
                    Ok(r) => tracing::info!(
                        processed = r.processed,
                        failed = r.failed,
                        "wallet_pipeline tick done"
                    ),
                    Err(e) => tracing::error!(error = %e, "wallet_pipeline failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let cfg = cfg.clone();
        async move {
            while retention_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = jobs::COHORT_RETENTION_JOB);
                let res = jobs::run_cohort_retention_once(&db, &cfg, chrono::Utc::now())
                    .instrument(span)
                    .await;
                match res {
                    Ok(r) => tracing::info!(
                        cohorts = r.cohorts,
                        significant_trends = r.significant_trends,
                        "cohort_retention tick done"
                    ),
                    Err(e) => tracing::error!(error = %e, "cohort_retention failed"),
                }
            }
        }
    });

    tracing::info!("worker loops spawned");

    // Workers are listening, so the immediate first ticks are received.
    let _scheduler_handles = scheduler::start(scheduler_jobs);
    tracing::info!("scheduler started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    // An interrupted wallet_pipeline resumes from its checkpoint on the next start.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
