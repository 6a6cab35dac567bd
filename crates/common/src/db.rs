use anyhow::Result;
use rusqlite::Connection;
use std::time::Duration;

use crate::error::AnalyticsError;

pub struct Database {
    pub conn: Connection,
}

/// Bounded retry policy for persistence operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub op_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &crate::config::Batch) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            op_timeout: Duration::from_secs(cfg.op_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Migrations need the write lock; another process (CLI, sqlite3 shell) may hold it.
        // Use a short busy_timeout per attempt and back off in Rust instead of failing.
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);
        let max_total_wait = Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    if !is_busy(&err) {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// Measures the full wall-clock time including queueing on the SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!(
            "analytics_db_query_latency_ms",
            "op" => op,
            "status" => status
        )
        .record(ms);
        if res.is_err() {
            metrics::counter!("analytics_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }

    /// [`Self::call_named`] with a per-attempt timeout and bounded exponential backoff.
    ///
    /// Only transient failures (busy/locked database, timeouts) are retried. Once the
    /// budget is spent the error is wrapped in [`AnalyticsError::RetryBudgetExhausted`].
    pub async fn call_with_retry<F, R>(
        &self,
        op: &'static str,
        policy: RetryPolicy,
        function: F,
    ) -> Result<R>
    where
        F: Fn(&mut rusqlite::Connection) -> Result<R> + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let mut backoff = policy.backoff_base;
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let f = function.clone();
            let res = match tokio::time::timeout(policy.op_timeout, self.call_named(op, f)).await {
                Ok(r) => r,
                Err(_) => Err(AnalyticsError::Timeout { op }.into()),
            };

            match res {
                Ok(v) => return Ok(v),
                Err(err) if is_transient(&err) => {
                    if attempt > policy.max_retries {
                        return Err(err.context(AnalyticsError::RetryBudgetExhausted {
                            op,
                            attempts: attempt,
                        }));
                    }
                    tracing::warn!(op, attempt, wait_for = ?backoff, error = %err, "transient db error; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn is_transient(err: &anyhow::Error) -> bool {
    if matches!(
        err.downcast_ref::<AnalyticsError>(),
        Some(AnalyticsError::Timeout { .. })
    ) {
        return true;
    }
    err.chain()
        .filter_map(|e| e.downcast_ref::<rusqlite::Error>())
        .any(is_busy)
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Let SQLite retry for up to 30s when another connection holds the lock.
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

/// Open an in-memory database with the schema applied. Test helper for every crate.
pub fn open_memory() -> Result<Connection> {
    let db = Database::open(":memory:")?;
    db.run_migrations()?;
    Ok(db.conn)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    wallet_id TEXT PRIMARY KEY,
    created_at TEXT,
    wallet_type TEXT NOT NULL DEFAULT 'standard',
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS inbound_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    received_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS processed_events (
    wallet_id TEXT NOT NULL,
    txid TEXT NOT NULL,
    activity_date TEXT NOT NULL,
    processed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (wallet_id, txid)
);

CREATE TABLE IF NOT EXISTS activity_metrics (
    wallet_id TEXT NOT NULL,
    activity_date TEXT NOT NULL,
    transaction_count INTEGER NOT NULL DEFAULT 0 CHECK (transaction_count >= 0),
    total_volume TEXT NOT NULL DEFAULT '0',
    total_fees TEXT NOT NULL DEFAULT '0',
    transfers_count INTEGER NOT NULL DEFAULT 0 CHECK (transfers_count >= 0),
    swaps_count INTEGER NOT NULL DEFAULT 0 CHECK (swaps_count >= 0),
    bridges_count INTEGER NOT NULL DEFAULT 0 CHECK (bridges_count >= 0),
    shielded_count INTEGER NOT NULL DEFAULT 0 CHECK (shielded_count >= 0),
    feature_events_count INTEGER NOT NULL DEFAULT 0 CHECK (feature_events_count >= 0),
    subtypes_json TEXT NOT NULL DEFAULT '[]',
    first_seen_at TEXT,
    last_seen_at TEXT,
    first_feature_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    is_returning INTEGER NOT NULL DEFAULT 0,
    days_since_creation INTEGER,
    creation_unknown INTEGER NOT NULL DEFAULT 0,
    sequence_complexity_score INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (wallet_id, activity_date)
);

CREATE TABLE IF NOT EXISTS cohorts (
    cohort_id INTEGER PRIMARY KEY AUTOINCREMENT,
    cohort_type TEXT NOT NULL,
    period_start TEXT NOT NULL,
    wallet_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (cohort_type, period_start)
);

CREATE TABLE IF NOT EXISTS cohort_assignments (
    wallet_id TEXT NOT NULL,
    cohort_id INTEGER NOT NULL REFERENCES cohorts(cohort_id),
    cohort_type TEXT NOT NULL,
    assigned_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (wallet_id, cohort_type)
);

CREATE TABLE IF NOT EXISTS cohort_retention (
    cohort_id INTEGER NOT NULL REFERENCES cohorts(cohort_id),
    offset_k INTEGER NOT NULL,
    retention_pct REAL NOT NULL CHECK (retention_pct >= 0 AND retention_pct <= 100),
    active_wallets INTEGER NOT NULL,
    is_preliminary INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (cohort_id, offset_k)
);

CREATE TABLE IF NOT EXISTS funnel_states (
    wallet_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    stage_index INTEGER NOT NULL,
    achieved_at TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (wallet_id, stage)
);

CREATE TABLE IF NOT EXISTS productivity_scores (
    wallet_id TEXT PRIMARY KEY,
    total_score INTEGER NOT NULL CHECK (total_score >= 0 AND total_score <= 100),
    previous_total_score INTEGER,
    retention_score REAL NOT NULL,
    adoption_score REAL NOT NULL,
    activity_score REAL NOT NULL,
    diversity_score REAL NOT NULL,
    status TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    cohort_retention_pct REAL,
    pending_tasks_json TEXT NOT NULL DEFAULT '[]',
    completed_tasks_json TEXT NOT NULL DEFAULT '[]',
    calculated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wallet_sync (
    wallet_id TEXT PRIMARY KEY,
    feed_cursor INTEGER NOT NULL DEFAULT 0,
    metrics_through TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS batch_checkpoints (
    job_name TEXT PRIMARY KEY,
    last_wallet_id TEXT NOT NULL,
    as_of TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_inbound_events_wallet_id ON inbound_events(wallet_id, id);
CREATE INDEX IF NOT EXISTS idx_processed_events_wallet_date ON processed_events(wallet_id, activity_date);
CREATE INDEX IF NOT EXISTS idx_activity_metrics_date ON activity_metrics(activity_date);
CREATE INDEX IF NOT EXISTS idx_cohort_assignments_cohort ON cohort_assignments(cohort_id);
CREATE INDEX IF NOT EXISTS idx_cohorts_type_start ON cohorts(cohort_type, period_start);
CREATE INDEX IF NOT EXISTS idx_productivity_scores_status ON productivity_scores(status);
"#;
