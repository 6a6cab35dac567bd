use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::db::AsyncDb;
use common::types::{TransactionEvent, WalletInfo};
use rusqlite::{Connection, OptionalExtension};
use std::io::BufRead;
use std::time::Instant;

use super::source_traits::{FeedBatch, TransactionFeed, WalletRegistry};
use crate::activity::{col_ts_opt, resolve_creation_date, ts_to_sql};
use crate::cohorts::assign_all_cohorts;

fn record_source_call<T>(source: &'static str, start: Instant, res: &Result<T>) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("analytics_source_latency_ms", "source" => source).record(ms);
    let status = if res.is_ok() { "ok" } else { "error" };
    metrics::counter!("analytics_source_requests_total", "source" => source, "status" => status)
        .increment(1);
}

/// Transaction feed backed by the `inbound_events` staging table.
#[derive(Clone)]
pub struct SqliteFeed {
    db: AsyncDb,
}

impl SqliteFeed {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }
}

pub fn read_feed(conn: &Connection, wallet_id: &str, cursor: i64) -> Result<FeedBatch> {
    let rows: Vec<(i64, String)> = conn
        .prepare(
            "SELECT id, payload_json FROM inbound_events
             WHERE wallet_id = ?1 AND id > ?2
             ORDER BY id ASC",
        )?
        .query_map(rusqlite::params![wallet_id, cursor], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut batch = FeedBatch {
        next_cursor: cursor,
        ..FeedBatch::default()
    };
    for (id, payload) in rows {
        batch.next_cursor = batch.next_cursor.max(id);
        match serde_json::from_str::<TransactionEvent>(&payload) {
            Ok(ev) => batch.events.push(ev),
            Err(e) => {
                batch.malformed += 1;
                tracing::warn!(wallet_id, inbound_id = id, error = %e, "malformed inbound event skipped");
            }
        }
    }
    if batch.malformed > 0 {
        metrics::counter!("analytics_malformed_events_total").increment(batch.malformed);
    }
    Ok(batch)
}

impl TransactionFeed for SqliteFeed {
    async fn fetch_since(&self, wallet_id: &str, cursor: i64) -> Result<FeedBatch> {
        let start = Instant::now();
        let wallet_id = wallet_id.to_string();
        let res = self
            .db
            .call_named("feed.fetch_since", move |conn| read_feed(conn, &wallet_id, cursor))
            .await;
        record_source_call("feed", start, &res);
        res
    }
}

/// Wallet registry backed by the `wallets` table.
#[derive(Clone)]
pub struct SqliteRegistry {
    db: AsyncDb,
}

impl SqliteRegistry {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }
}

fn wallet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletInfo> {
    Ok(WalletInfo {
        wallet_id: row.get(0)?,
        created_at: col_ts_opt(row, 1)?,
        wallet_type: row.get(2)?,
    })
}

pub fn read_wallet(conn: &Connection, wallet_id: &str) -> Result<Option<WalletInfo>> {
    Ok(conn
        .query_row(
            "SELECT wallet_id, created_at, wallet_type FROM wallets WHERE wallet_id = ?1",
            [wallet_id],
            wallet_from_row,
        )
        .optional()?)
}

pub fn read_wallets_after(conn: &Connection, after: Option<&str>, limit: u32) -> Result<Vec<WalletInfo>> {
    let rows = conn
        .prepare(
            "SELECT wallet_id, created_at, wallet_type FROM wallets
             WHERE (?1 IS NULL OR wallet_id > ?1)
             ORDER BY wallet_id ASC
             LIMIT ?2",
        )?
        .query_map(rusqlite::params![after, limit], wallet_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl WalletRegistry for SqliteRegistry {
    async fn wallet(&self, wallet_id: &str) -> Result<Option<WalletInfo>> {
        let start = Instant::now();
        let wallet_id = wallet_id.to_string();
        let res = self
            .db
            .call_named("registry.wallet", move |conn| read_wallet(conn, &wallet_id))
            .await;
        record_source_call("registry", start, &res);
        res
    }

    async fn wallets_after(&self, after: Option<&str>, limit: u32) -> Result<Vec<WalletInfo>> {
        let start = Instant::now();
        let after = after.map(str::to_string);
        let res = self
            .db
            .call_named("registry.wallets_after", move |conn| {
                read_wallets_after(conn, after.as_deref(), limit)
            })
            .await;
        record_source_call("registry", start, &res);
        res
    }
}

/// Upsert a registry row. A known creation date is never replaced by an unknown one.
///
/// When the creation date is known the wallet is assigned to its weekly and
/// monthly cohorts and any metrics recorded while it was unknown are resolved.
pub fn register_wallet(
    conn: &mut Connection,
    wallet_id: &str,
    created_at: Option<DateTime<Utc>>,
    wallet_type: &str,
) -> Result<WalletInfo> {
    conn.execute(
        "INSERT INTO wallets (wallet_id, created_at, wallet_type) VALUES (?1, ?2, ?3)
         ON CONFLICT(wallet_id) DO UPDATE SET
            created_at = COALESCE(wallets.created_at, excluded.created_at),
            wallet_type = excluded.wallet_type",
        rusqlite::params![wallet_id, created_at.map(ts_to_sql), wallet_type],
    )?;
    let wallet = read_wallet(conn, wallet_id)?
        .with_context(|| format!("wallet {wallet_id} missing after upsert"))?;
    if let Some(created) = wallet.created_at {
        assign_all_cohorts(conn, wallet_id, created)?;
        let resolved = resolve_creation_date(conn, wallet_id, created)?;
        if resolved > 0 {
            tracing::info!(wallet_id, resolved, "creation date resolved for stored metrics");
        }
    }
    Ok(wallet)
}

/// Stage newline-delimited JSON events into `inbound_events`. Blank lines are
/// skipped; undecodable lines are counted and skipped.
pub fn ingest_jsonl(conn: &mut Connection, reader: impl BufRead) -> Result<(u64, u64)> {
    let tx = conn.transaction()?;
    let mut staged = 0_u64;
    let mut rejected = 0_u64;
    {
        let mut insert = tx.prepare(
            "INSERT INTO inbound_events (wallet_id, payload_json) VALUES (?1, ?2)",
        )?;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransactionEvent>(&line) {
                Ok(ev) => {
                    insert.execute(rusqlite::params![ev.wallet_id, serde_json::to_string(&ev)?])?;
                    staged += 1;
                }
                Err(e) => {
                    rejected += 1;
                    tracing::warn!(line = lineno + 1, error = %e, "rejected feed line");
                }
            }
        }
    }
    tx.commit()?;
    Ok((staged, rejected))
}
