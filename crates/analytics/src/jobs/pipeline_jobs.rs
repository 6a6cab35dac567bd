use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::config::Config;
use common::db::{AsyncDb, RetryPolicy};
use common::error::AnalyticsError;
use common::types::{CohortType, WalletInfo};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::activity::{aggregate, ts_from_sql, ts_to_sql, AggregateReport, AggregationMode};
use crate::cohorts::{assign_all_cohorts, detect_trends, load_cohorts, recompute_cohort};
use crate::funnel;
use crate::scoring::{self, ProductivityScore};

use super::source_traits::{FeedBatch, TransactionFeed, WalletRegistry};
use super::tracker::JobTracker;
use super::wallet_locks::WalletLocks;

pub const WALLET_PIPELINE_JOB: &str = "wallet_pipeline";
pub const COHORT_RETENTION_JOB: &str = "cohort_retention";
const CHUNK_SIZE: u32 = 100;

/// Outcome of one wallet's Aggregator → Funnel → Scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletOutcome {
    pub wallet_id: String,
    pub aggregate: AggregateReport,
    pub stages_advanced: usize,
    pub total_score: u8,
    pub conflicts: u32,
}

/// Last fully processed day for an `as_of` instant.
pub fn metrics_through(as_of: DateTime<Utc>) -> NaiveDate {
    as_of.date_naive() - Duration::days(1)
}

fn read_cursor(conn: &Connection, wallet_id: &str) -> Result<i64> {
    Ok(conn
        .query_row(
            "SELECT feed_cursor FROM wallet_sync WHERE wallet_id = ?1",
            [wallet_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

fn write_sync(conn: &Connection, wallet_id: &str, cursor: i64, through: NaiveDate) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_sync (wallet_id, feed_cursor, metrics_through, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(wallet_id) DO UPDATE SET
            feed_cursor = MAX(wallet_sync.feed_cursor, excluded.feed_cursor),
            metrics_through = CASE
                WHEN wallet_sync.metrics_through IS NULL
                  OR wallet_sync.metrics_through < excluded.metrics_through
                THEN excluded.metrics_through
                ELSE wallet_sync.metrics_through END,
            updated_at = excluded.updated_at",
        rusqlite::params![wallet_id, cursor, through.to_string()],
    )?;
    Ok(())
}

/// One pass of the per-wallet pipeline on a connection.
///
/// Every step is idempotent, so the whole pass is safe to repeat after a
/// recalculation conflict or an interrupted batch.
pub fn run_wallet_steps(
    conn: &mut Connection,
    wallet: &WalletInfo,
    batch: &FeedBatch,
    mode: AggregationMode,
    as_of: DateTime<Utc>,
    cfg: &Config,
) -> Result<(AggregateReport, usize, ProductivityScore)> {
    if let Some(created) = wallet.created_at {
        assign_all_cohorts(conn, &wallet.wallet_id, created)?;
        crate::activity::resolve_creation_date(conn, &wallet.wallet_id, created)?;
    }
    let report = aggregate(conn, wallet, &batch.events, mode, &cfg.activity)?;
    let eval = funnel::evaluate(conn, wallet, as_of, &cfg.funnel)?;
    let score = scoring::recalculate(conn, &wallet.wallet_id, as_of, &cfg.scoring)?;
    // A backfill skips events outside its range, so neither the feed cursor nor
    // the watermark may move past them.
    if mode == AggregationMode::Incremental {
        write_sync(conn, &wallet.wallet_id, batch.next_cursor, metrics_through(as_of))?;
    }
    Ok((report, eval.advanced.len(), score))
}

/// Run the pipeline for one wallet under its lock, retrying the whole pass on a
/// recalculation conflict.
pub async fn process_wallet<F: TransactionFeed + Sync>(
    db: &AsyncDb,
    feed: &F,
    locks: &WalletLocks,
    wallet: WalletInfo,
    mode: AggregationMode,
    as_of: DateTime<Utc>,
    cfg: Arc<Config>,
) -> Result<WalletOutcome> {
    let _guard = locks.lock(&wallet.wallet_id).await;
    let policy = RetryPolicy::from_config(&cfg.batch);

    let cursor = match mode {
        AggregationMode::Incremental => {
            let id = wallet.wallet_id.clone();
            db.call_with_retry("wallet_pipeline.read_cursor", policy, move |conn| {
                read_cursor(conn, &id)
            })
            .await?
        }
        // A backfill re-reads the wallet's whole history and filters by date.
        AggregationMode::Backfill { .. } => 0,
    };
    let batch = Arc::new(feed.fetch_since(&wallet.wallet_id, cursor).await?);
    let wallet = Arc::new(wallet);

    let mut conflicts = 0_u32;
    loop {
        let res = db
            .call_with_retry("wallet_pipeline.run", policy, {
                let wallet = wallet.clone();
                let batch = batch.clone();
                let cfg = cfg.clone();
                move |conn| run_wallet_steps(conn, &wallet, &batch, mode, as_of, &cfg)
            })
            .await;

        match res {
            Ok((aggregate, stages_advanced, score)) => {
                metrics::counter!("analytics_wallets_processed_total").increment(1);
                return Ok(WalletOutcome {
                    wallet_id: wallet.wallet_id.clone(),
                    aggregate,
                    stages_advanced,
                    total_score: score.total_score,
                    conflicts,
                });
            }
            Err(e) if AnalyticsError::is_conflict(&e) && conflicts < policy.max_retries => {
                conflicts += 1;
                metrics::counter!("analytics_recalculation_conflicts_total").increment(1);
                tracing::warn!(
                    wallet_id = %wallet.wallet_id,
                    attempt = conflicts,
                    "concurrent recalculation detected; retrying wallet pipeline"
                );
            }
            Err(e) => return Err(e.context(format!("wallet pipeline for {}", wallet.wallet_id))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub processed: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub events_accepted: u64,
    pub duplicates: u64,
    pub resumed_after: Option<String>,
}

/// The persistence layer gave up; continuing the batch would fail the same way.
fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AnalyticsError>(),
        Some(AnalyticsError::RetryBudgetExhausted { .. })
    )
}

fn read_checkpoint(conn: &Connection, job: &str) -> Result<Option<(String, DateTime<Utc>)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT last_wallet_id, as_of FROM batch_checkpoints WHERE job_name = ?1",
            [job],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(w, at)| -> Result<_> { Ok((w, ts_from_sql(&at)?)) })
        .transpose()
}

fn write_checkpoint(conn: &Connection, job: &str, last_wallet_id: &str, as_of: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO batch_checkpoints (job_name, last_wallet_id, as_of, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(job_name) DO UPDATE SET
            last_wallet_id = excluded.last_wallet_id,
            as_of = excluded.as_of,
            updated_at = excluded.updated_at",
        rusqlite::params![job, last_wallet_id, ts_to_sql(as_of)],
    )?;
    Ok(())
}

fn clear_checkpoint(conn: &Connection, job: &str) -> Result<()> {
    conn.execute("DELETE FROM batch_checkpoints WHERE job_name = ?1", [job])?;
    Ok(())
}

/// Recompute every registered wallet as of `as_of`, in `wallet_id` order.
///
/// Wallets run in parallel (bounded by `batch.concurrency`) one chunk at a time; a
/// checkpoint is written after each chunk. A run that finds a checkpoint resumes
/// after it, with the interrupted run's `as_of`.
pub async fn run_wallet_pipeline_once<F, R>(
    db: &AsyncDb,
    feed: &F,
    registry: &R,
    locks: &WalletLocks,
    cfg: Arc<Config>,
    as_of: DateTime<Utc>,
) -> Result<PipelineReport>
where
    F: TransactionFeed + Clone + Send + Sync + 'static,
    R: WalletRegistry + Sync,
{
    let tracker = JobTracker::start(db, WALLET_PIPELINE_JOB).await?;
    match drive_wallet_pipeline(db, feed, registry, locks, cfg, as_of, &tracker).await {
        Ok(report) => {
            tracker.success(Some(serde_json::to_value(&report)?)).await?;
            Ok(report)
        }
        Err(e) => {
            tracing::error!(error = %e, "wallet_pipeline aborted; checkpoint kept for resume");
            tracker.fail(&e).await?;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_wallet_pipeline<F, R>(
    db: &AsyncDb,
    feed: &F,
    registry: &R,
    locks: &WalletLocks,
    cfg: Arc<Config>,
    as_of: DateTime<Utc>,
    tracker: &JobTracker,
) -> Result<PipelineReport>
where
    F: TransactionFeed + Clone + Send + Sync + 'static,
    R: WalletRegistry + Sync,
{
    let policy = RetryPolicy::from_config(&cfg.batch);
    let checkpoint = db
        .call_with_retry("wallet_pipeline.read_checkpoint", policy, |conn| {
            read_checkpoint(conn, WALLET_PIPELINE_JOB)
        })
        .await?;

    let mut report = PipelineReport::default();
    let (mut after, as_of) = match checkpoint {
        Some((last, checkpoint_as_of)) => {
            tracing::info!(after = %last, as_of = %checkpoint_as_of, "resuming wallet_pipeline from checkpoint");
            report.resumed_after = Some(last.clone());
            (Some(last), checkpoint_as_of)
        }
        None => (None, as_of),
    };

    let semaphore = Arc::new(Semaphore::new(cfg.batch.concurrency.max(1)));
    loop {
        let wallets = registry.wallets_after(after.as_deref(), CHUNK_SIZE).await?;
        let Some(last) = wallets.last().map(|w| w.wallet_id.clone()) else {
            break;
        };

        let mut set = JoinSet::new();
        for wallet in wallets {
            let permit = semaphore.clone().acquire_owned().await?;
            let (db, feed, locks, cfg) = (db.clone(), feed.clone(), locks.clone(), cfg.clone());
            set.spawn(async move {
                let _permit = permit;
                let id = wallet.wallet_id.clone();
                let res = process_wallet(&db, &feed, &locks, wallet, AggregationMode::Incremental, as_of, cfg).await;
                (id, res)
            });
        }

        let mut fatal: Option<anyhow::Error> = None;
        while let Some(joined) = set.join_next().await {
            let (wallet_id, res) = joined.context("wallet pipeline task panicked")?;
            match res {
                Ok(outcome) => {
                    report.processed += 1;
                    report.conflicts += u64::from(outcome.conflicts);
                    report.events_accepted += outcome.aggregate.accepted;
                    report.duplicates += outcome.aggregate.duplicates;
                }
                Err(e) if is_fatal(&e) => {
                    report.failed += 1;
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(wallet_id = %wallet_id, error = %e, "wallet pipeline failed; continuing batch");
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let last_c = last.clone();
        db.call_with_retry("wallet_pipeline.write_checkpoint", policy, move |conn| {
            write_checkpoint(conn, WALLET_PIPELINE_JOB, &last_c, as_of)
        })
        .await?;
        tracker
            .update_progress(serde_json::json!({
                "processed": report.processed,
                "failed": report.failed,
                "last_wallet_id": last,
                "phase": "wallets"
            }))
            .await?;
        after = Some(last);
    }

    db.call_with_retry("wallet_pipeline.clear_checkpoint", policy, |conn| {
        clear_checkpoint(conn, WALLET_PIPELINE_JOB)
    })
    .await?;
    locks.prune();

    tracing::info!(
        processed = report.processed,
        failed = report.failed,
        conflicts = report.conflicts,
        "wallet_pipeline complete"
    );
    Ok(report)
}

/// Rebuild one wallet's metrics for `[from, to]` from the feed, then refresh its
/// funnel and score.
#[allow(clippy::too_many_arguments)]
pub async fn run_backfill_once<F, R>(
    db: &AsyncDb,
    feed: &F,
    registry: &R,
    locks: &WalletLocks,
    cfg: Arc<Config>,
    wallet_id: &str,
    from: NaiveDate,
    to: NaiveDate,
    as_of: DateTime<Utc>,
) -> Result<WalletOutcome>
where
    F: TransactionFeed + Sync,
    R: WalletRegistry + Sync,
{
    if from > to {
        return Err(AnalyticsError::InvalidDateRange { from, to }.into());
    }
    let wallet = registry
        .wallet(wallet_id)
        .await?
        .with_context(|| format!("wallet {wallet_id} is not registered"))?;
    let outcome = process_wallet(db, feed, locks, wallet, AggregationMode::Backfill { from, to }, as_of, cfg).await?;
    tracing::info!(
        wallet_id,
        %from,
        %to,
        accepted = outcome.aggregate.accepted,
        out_of_range = outcome.aggregate.out_of_range,
        "backfill complete"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub cohorts: u64,
    pub preliminary_values: u64,
    pub significant_trends: u64,
}

/// Recompute cached retention for every cohort and flag significant trends.
pub async fn run_cohort_retention_once(
    db: &AsyncDb,
    cfg: &Config,
    as_of: DateTime<Utc>,
) -> Result<RetentionReport> {
    let tracker = JobTracker::start(db, COHORT_RETENTION_JOB).await?;
    let policy = RetryPolicy::from_config(&cfg.batch);
    let cohorts_cfg = Arc::new(cfg.cohorts.clone());

    let res = db
        .call_with_retry("cohort_retention.recompute", policy, {
            let cohorts_cfg = cohorts_cfg.clone();
            move |conn| {
                let mut report = RetentionReport::default();
                let mut all = Vec::new();
                for t in CohortType::ALL {
                    let mut recomputed = Vec::new();
                    for cohort in load_cohorts(conn, t, None, None)? {
                        let r = recompute_cohort(conn, &cohort, as_of.date_naive(), cohorts_cfg.max_offset)
                            .with_context(|| format!("recompute cohort {}", cohort.cohort_id))?;
                        report.cohorts += 1;
                        report.preliminary_values +=
                            r.points.iter().filter(|p| p.preliminary).count() as u64;
                        recomputed.push(r);
                    }
                    all.push((t, detect_trends(&recomputed, cohorts_cfg.max_offset, cohorts_cfg.trend_threshold_pct)));
                }
                Ok((report, all))
            }
        })
        .await;

    let (mut report, trends) = match res {
        Ok(v) => v,
        Err(e) => {
            tracker.fail(&e).await?;
            return Err(e);
        }
    };

    for (t, trends) in trends {
        for trend in trends.iter().filter(|tr| tr.significant) {
            report.significant_trends += 1;
            metrics::counter!("analytics_retention_trend_alerts_total", "cohort_type" => t.as_str())
                .increment(1);
            tracing::warn!(
                cohort_type = t.as_str(),
                offset = trend.offset,
                latest_period = %trend.latest_period,
                previous_period = %trend.previous_period,
                delta = trend.delta,
                "significant retention change"
            );
        }
    }

    tracker.success(Some(serde_json::to_value(&report)?)).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::load_metrics;
    use crate::activity::tests::ts;
    use crate::jobs::source_impls::{ingest_jsonl, register_wallet, SqliteFeed, SqliteRegistry};
    use common::types::FunnelStage;

    fn test_config() -> Arc<Config> {
        let mut cfg = Config::from_toml_str(include_str!("../../../../config/default.toml")).unwrap();
        cfg.batch.backoff_base_ms = 1;
        cfg.batch.concurrency = 4;
        Arc::new(cfg)
    }

    fn line(wallet: &str, txid: &str, at: &str, tx_type: &str, value: &str) -> String {
        format!(
            r#"{{"wallet_id":"{wallet}","txid":"{txid}","block_timestamp":"{at}","type":"{tx_type}","value":"{value}"}}"#
        )
    }

    async fn seeded_db(wallets: usize) -> AsyncDb {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(move |conn| {
            let mut lines = Vec::new();
            for i in 0..wallets {
                let id = format!("w{i:03}");
                register_wallet(conn, &id, Some(ts(2024, 1, 1, 0)), "standard")?;
                lines.push(line(&id, "a", "2024-01-02T10:00:00Z", "transfer", "10"));
                lines.push(line(&id, "b", "2024-01-03T10:00:00Z", "swap", "20"));
                // Redelivery.
                lines.push(line(&id, "a", "2024-01-02T10:00:00Z", "transfer", "10"));
            }
            ingest_jsonl(conn, lines.join("\n").as_bytes())?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_pipeline_processes_every_wallet_once() {
        let db = seeded_db(5).await;
        let (feed, registry) = (SqliteFeed::new(db.clone()), SqliteRegistry::new(db.clone()));
        let locks = WalletLocks::new();
        let as_of = ts(2024, 1, 10, 0);

        let report = run_wallet_pipeline_once(&db, &feed, &registry, &locks, test_config(), as_of)
            .await
            .unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.events_accepted, 10);
        assert_eq!(report.duplicates, 5);

        let (metrics, state, score, checkpoint) = db
            .call(|conn| {
                Ok((
                    load_metrics(conn, "w003", None, None)?,
                    funnel::load_state(conn, "w003")?,
                    scoring::load_score(conn, "w003")?,
                    read_checkpoint(conn, WALLET_PIPELINE_JOB)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics[1].is_returning);
        assert_eq!(state.achieved_at(FunnelStage::FeatureUsage), Some(ts(2024, 1, 3, 10)));
        assert!(score.is_some());
        assert!(checkpoint.is_none(), "checkpoint cleared on completion");

        // A second run sees no new events and leaves metrics unchanged.
        let again = run_wallet_pipeline_once(&db, &feed, &registry, &locks, test_config(), as_of)
            .await
            .unwrap();
        assert_eq!(again.events_accepted, 0);
        let metrics_after = db
            .call(|conn| load_metrics(conn, "w003", None, None))
            .await
            .unwrap();
        assert_eq!(metrics, metrics_after);
    }

    #[tokio::test]
    async fn test_pipeline_resumes_after_checkpoint() {
        let db = seeded_db(3).await;
        let (feed, registry) = (SqliteFeed::new(db.clone()), SqliteRegistry::new(db.clone()));
        let interrupted_as_of = ts(2024, 1, 8, 0);
        db.call(move |conn| write_checkpoint(conn, WALLET_PIPELINE_JOB, "w000", interrupted_as_of))
            .await
            .unwrap();

        let report = run_wallet_pipeline_once(
            &db,
            &feed,
            &registry,
            &WalletLocks::new(),
            test_config(),
            ts(2024, 2, 1, 0),
        )
        .await
        .unwrap();
        assert_eq!(report.resumed_after.as_deref(), Some("w000"));
        assert_eq!(report.processed, 2);

        let (skipped, resumed) = db
            .call(|conn| Ok((scoring::score_version(conn, "w000")?, scoring::score_version(conn, "w001")?)))
            .await
            .unwrap();
        assert_eq!(skipped, None);
        assert_eq!(resumed, Some(interrupted_as_of));
    }

    #[tokio::test]
    async fn test_concurrent_runs_for_same_wallet_are_serialized() {
        let db = seeded_db(1).await;
        let feed = SqliteFeed::new(db.clone());
        let locks = WalletLocks::new();
        let cfg = test_config();
        let wallet = WalletInfo {
            wallet_id: "w000".to_string(),
            created_at: Some(ts(2024, 1, 1, 0)),
            wallet_type: "standard".to_string(),
        };

        let as_of = ts(2024, 1, 10, 0);
        let (a, b) = tokio::join!(
            process_wallet(&db, &feed, &locks, wallet.clone(), AggregationMode::Incremental, as_of, cfg.clone()),
            process_wallet(&db, &feed, &locks, wallet.clone(), AggregationMode::Incremental, as_of, cfg.clone()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.aggregate.accepted + b.aggregate.accepted, 2);
        assert_eq!(a.total_score, b.total_score);
    }

    #[tokio::test]
    async fn test_backfill_rebuilds_range() {
        let db = seeded_db(1).await;
        let (feed, registry) = (SqliteFeed::new(db.clone()), SqliteRegistry::new(db.clone()));
        let locks = WalletLocks::new();
        let cfg = test_config();
        let as_of = ts(2024, 1, 10, 0);
        run_wallet_pipeline_once(&db, &feed, &registry, &locks, cfg.clone(), as_of)
            .await
            .unwrap();
        let before = db.call(|conn| load_metrics(conn, "w000", None, None)).await.unwrap();

        let from = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let outcome = run_backfill_once(&db, &feed, &registry, &locks, cfg.clone(), "w000", from, to, as_of)
            .await
            .unwrap();
        assert_eq!(outcome.aggregate.accepted, 1);
        assert_eq!(outcome.aggregate.out_of_range, 2);

        let after = db.call(|conn| load_metrics(conn, "w000", None, None)).await.unwrap();
        assert_eq!(before, after);

        let err = run_backfill_once(&db, &feed, &registry, &locks, cfg, "w000", to, from, as_of)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<AnalyticsError>().is_some());
    }

    #[tokio::test]
    async fn test_backfill_leaves_later_events_for_incremental_run() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            register_wallet(conn, "w1", Some(ts(2024, 1, 1, 0)), "standard")?;
            ingest_jsonl(conn, line("w1", "jan", "2024-01-02T10:00:00Z", "transfer", "10").as_bytes())?;
            Ok(())
        })
        .await
        .unwrap();
        let (feed, registry) = (SqliteFeed::new(db.clone()), SqliteRegistry::new(db.clone()));
        let locks = WalletLocks::new();
        let cfg = test_config();

        run_wallet_pipeline_once(&db, &feed, &registry, &locks, cfg.clone(), ts(2024, 1, 10, 0))
            .await
            .unwrap();
        db.call(|conn| {
            ingest_jsonl(conn, line("w1", "feb", "2024-02-05T10:00:00Z", "swap", "20").as_bytes())?;
            Ok(())
        })
        .await
        .unwrap();

        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let outcome = run_backfill_once(&db, &feed, &registry, &locks, cfg.clone(), "w1", from, to, ts(2024, 2, 10, 0))
            .await
            .unwrap();
        assert_eq!(outcome.aggregate.out_of_range, 1);

        let after_backfill = run_wallet_pipeline_once(&db, &feed, &registry, &locks, cfg, ts(2024, 2, 10, 0))
            .await
            .unwrap();
        assert_eq!(after_backfill.events_accepted, 1);

        let dates: Vec<String> = db
            .call(|conn| load_metrics(conn, "w1", None, None))
            .await
            .unwrap()
            .iter()
            .map(|m| m.activity_date.to_string())
            .collect();
        assert_eq!(dates, vec!["2024-01-02", "2024-02-05"]);
    }

    #[tokio::test]
    async fn test_retention_job_marks_unsynced_values_preliminary() {
        let db = seeded_db(2).await;
        let (feed, registry) = (SqliteFeed::new(db.clone()), SqliteRegistry::new(db.clone()));
        let cfg = test_config();

        // Nothing synced yet: the barrier keeps every value preliminary.
        let early = run_cohort_retention_once(&db, &cfg, ts(2024, 3, 1, 0)).await.unwrap();
        assert_eq!(early.cohorts, 2);
        assert_eq!(early.preliminary_values, 8);

        run_wallet_pipeline_once(&db, &feed, &registry, &WalletLocks::new(), cfg.clone(), ts(2024, 3, 1, 0))
            .await
            .unwrap();
        let synced = run_cohort_retention_once(&db, &cfg, ts(2024, 3, 1, 0)).await.unwrap();
        // Weekly offsets 1..4 end by 2024-02-04; monthly offset 1 ends 2024-02-29.
        assert_eq!(synced.preliminary_values, 3);
    }

    #[test]
    fn test_only_exhausted_retry_budget_aborts_batch() {
        let exhausted = anyhow::Error::from(AnalyticsError::RetryBudgetExhausted {
            op: "wallet_pipeline.run",
            attempts: 4,
        })
        .context("wallet pipeline for w1");
        assert!(is_fatal(&exhausted));

        let conflict = anyhow::Error::from(AnalyticsError::RecalculationConflict {
            wallet_id: "w1".to_string(),
        });
        assert!(!is_fatal(&conflict));
        assert!(!is_fatal(&anyhow::anyhow!("malformed row")));
    }

    #[test]
    fn test_metrics_through_is_previous_day() {
        assert_eq!(metrics_through(ts(2024, 1, 10, 0)), NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
        assert_eq!(metrics_through(ts(2024, 1, 10, 23)), NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
    }
}
