//! Daily activity aggregation.
//!
//! Turns classified transaction events into one [`ActivityMetric`] per
//! (wallet, UTC calendar day). Every write is a merge of commutative
//! accumulators (counts, exact decimal sums, set unions, min/max timestamps),
//! so redelivery and out-of-order arrival converge to the same rows.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use common::config::Activity as ActivityConfig;
use common::error::AnalyticsError;
use common::types::{TransactionEvent, TxType, WalletInfo};
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Incremental,
    /// Rebuild `[from, to]` (inclusive) from the supplied events only.
    Backfill { from: NaiveDate, to: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityMetric {
    pub wallet_id: String,
    pub activity_date: NaiveDate,
    pub transaction_count: u32,
    pub total_volume: Decimal,
    pub total_fees: Decimal,
    pub transfers_count: u32,
    pub swaps_count: u32,
    pub bridges_count: u32,
    pub shielded_count: u32,
    pub feature_events_count: u32,
    pub subtypes: BTreeSet<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub first_feature_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_returning: bool,
    /// `None` when the wallet's creation date is unknown.
    pub days_since_creation: Option<i64>,
    pub sequence_complexity_score: u32,
}

impl ActivityMetric {
    pub fn type_count(&self, t: TxType) -> u32 {
        match t {
            TxType::Transfer => self.transfers_count,
            TxType::Swap => self.swaps_count,
            TxType::Bridge => self.bridges_count,
            TxType::Shielded => self.shielded_count,
            TxType::Other => self
                .transaction_count
                .saturating_sub(self.transfers_count + self.swaps_count + self.bridges_count + self.shielded_count),
        }
    }

    pub fn has_feature_usage(&self) -> bool {
        self.feature_events_count > 0
            || self.swaps_count > 0
            || self.bridges_count > 0
            || self.shielded_count > 0
    }
}

/// Commutative per-day accumulator. `merge` is associative and commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayAccumulator {
    pub transaction_count: u32,
    pub total_volume: Decimal,
    pub total_fees: Decimal,
    pub transfers_count: u32,
    pub swaps_count: u32,
    pub bridges_count: u32,
    pub shielded_count: u32,
    pub feature_events_count: u32,
    pub subtypes: BTreeSet<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub first_feature_at: Option<DateTime<Utc>>,
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl DayAccumulator {
    pub fn add_event(&mut self, ev: &TransactionEvent) {
        self.transaction_count += 1;
        self.total_volume += ev.value;
        self.total_fees += ev.fee;
        match ev.tx_type {
            TxType::Transfer => self.transfers_count += 1,
            TxType::Swap => self.swaps_count += 1,
            TxType::Bridge => self.bridges_count += 1,
            TxType::Shielded => self.shielded_count += 1,
            TxType::Other => {}
        }
        if ev.feature_flag {
            self.feature_events_count += 1;
        }
        self.subtypes.insert(ev.subtype_key());
        let ts = Some(ev.block_timestamp);
        self.first_seen_at = min_opt(self.first_seen_at, ts);
        self.last_seen_at = max_opt(self.last_seen_at, ts);
        if ev.is_feature_usage() {
            self.first_feature_at = min_opt(self.first_feature_at, ts);
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.transaction_count += other.transaction_count;
        self.total_volume += other.total_volume;
        self.total_fees += other.total_fees;
        self.transfers_count += other.transfers_count;
        self.swaps_count += other.swaps_count;
        self.bridges_count += other.bridges_count;
        self.shielded_count += other.shielded_count;
        self.feature_events_count += other.feature_events_count;
        self.subtypes.extend(other.subtypes.iter().cloned());
        self.first_seen_at = min_opt(self.first_seen_at, other.first_seen_at);
        self.last_seen_at = max_opt(self.last_seen_at, other.last_seen_at);
        self.first_feature_at = min_opt(self.first_feature_at, other.first_feature_at);
    }

    fn from_metric(m: &ActivityMetric) -> Self {
        Self {
            transaction_count: m.transaction_count,
            total_volume: m.total_volume,
            total_fees: m.total_fees,
            transfers_count: m.transfers_count,
            swaps_count: m.swaps_count,
            bridges_count: m.bridges_count,
            shielded_count: m.shielded_count,
            feature_events_count: m.feature_events_count,
            subtypes: m.subtypes.clone(),
            first_seen_at: m.first_seen_at,
            last_seen_at: m.last_seen_at,
            first_feature_at: m.first_feature_at,
        }
    }
}

/// Bucket events by UTC calendar date of their block timestamp.
pub fn accumulate<'a>(
    events: impl IntoIterator<Item = &'a TransactionEvent>,
) -> BTreeMap<NaiveDate, DayAccumulator> {
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
    for ev in events {
        days.entry(ev.block_timestamp.date_naive())
            .or_default()
            .add_event(ev);
    }
    days
}

pub fn sequence_complexity_score(distinct_subtypes: usize, cfg: &ActivityConfig) -> u32 {
    let distinct = u32::try_from(distinct_subtypes).unwrap_or(u32::MAX);
    distinct
        .saturating_mul(cfg.complexity_points_per_subtype)
        .min(cfg.complexity_cap)
}

/// Derive the stored metric for one day. `is_returning` is filled in by the caller,
/// which knows the wallet's full set of active dates.
pub fn derive_metric(
    wallet_id: &str,
    date: NaiveDate,
    acc: &DayAccumulator,
    created_at: Option<DateTime<Utc>>,
    cfg: &ActivityConfig,
) -> ActivityMetric {
    let days_since_creation = created_at.map(|c| (date - c.date_naive()).num_days().max(0));
    ActivityMetric {
        wallet_id: wallet_id.to_string(),
        activity_date: date,
        transaction_count: acc.transaction_count,
        total_volume: acc.total_volume.normalize(),
        total_fees: acc.total_fees.normalize(),
        transfers_count: acc.transfers_count,
        swaps_count: acc.swaps_count,
        bridges_count: acc.bridges_count,
        shielded_count: acc.shielded_count,
        feature_events_count: acc.feature_events_count,
        subtypes: acc.subtypes.clone(),
        first_seen_at: acc.first_seen_at,
        last_seen_at: acc.last_seen_at,
        first_feature_at: acc.first_feature_at,
        is_active: acc.transaction_count > 0,
        is_returning: false,
        days_since_creation,
        sequence_complexity_score: sequence_complexity_score(acc.subtypes.len(), cfg),
    }
}

/// Set `is_returning` on a date-ordered slice: true iff an earlier date was active.
pub fn mark_returning(metrics: &mut [ActivityMetric]) {
    let mut seen_active = false;
    for m in metrics.iter_mut() {
        m.is_returning = seen_active;
        seen_active |= m.is_active;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    pub accepted: u64,
    pub duplicates: u64,
    pub out_of_range: u64,
    pub foreign_wallet: u64,
    pub dates_touched: u64,
    pub creation_unknown: bool,
}

/// Fold `events` for one wallet into `activity_metrics`.
///
/// Dedup is keyed on `processed_events (wallet_id, txid)`: a redelivered txid is a
/// no-op. In backfill mode the range is cleared first (metrics and dedup ledger)
/// and rebuilt from the supplied events that fall inside it.
pub fn aggregate(
    conn: &mut Connection,
    wallet: &WalletInfo,
    events: &[TransactionEvent],
    mode: AggregationMode,
    cfg: &ActivityConfig,
) -> Result<AggregateReport> {
    let mut report = AggregateReport {
        creation_unknown: wallet.created_at.is_none(),
        ..AggregateReport::default()
    };
    if let AggregationMode::Backfill { from, to } = mode {
        if from > to {
            return Err(AnalyticsError::InvalidDateRange { from, to }.into());
        }
    }

    let tx = conn.transaction()?;

    if let AggregationMode::Backfill { from, to } = mode {
        let (f, t) = (from.to_string(), to.to_string());
        tx.execute(
            "DELETE FROM processed_events
             WHERE wallet_id = ?1 AND activity_date >= ?2 AND activity_date <= ?3",
            rusqlite::params![wallet.wallet_id, f, t],
        )?;
        tx.execute(
            "DELETE FROM activity_metrics
             WHERE wallet_id = ?1 AND activity_date >= ?2 AND activity_date <= ?3",
            rusqlite::params![wallet.wallet_id, f, t],
        )?;
    }

    let mut accepted: Vec<&TransactionEvent> = Vec::with_capacity(events.len());
    {
        let mut mark_seen = tx.prepare(
            "INSERT OR IGNORE INTO processed_events (wallet_id, txid, activity_date)
             VALUES (?1, ?2, ?3)",
        )?;
        for ev in events {
            if ev.wallet_id != wallet.wallet_id {
                report.foreign_wallet += 1;
                continue;
            }
            let date = ev.block_timestamp.date_naive();
            if let AggregationMode::Backfill { from, to } = mode {
                if date < from || date > to {
                    report.out_of_range += 1;
                    continue;
                }
            }
            let inserted =
                mark_seen.execute(rusqlite::params![ev.wallet_id, ev.txid, date.to_string()])?;
            if inserted == 0 {
                report.duplicates += 1;
                tracing::debug!(wallet_id = %ev.wallet_id, txid = %ev.txid, "duplicate event ignored");
                continue;
            }
            accepted.push(ev);
        }
    }
    report.accepted = accepted.len() as u64;

    let days = accumulate(accepted.iter().copied());
    report.dates_touched = days.len() as u64;

    for (date, delta) in &days {
        let mut acc = load_metric(&tx, &wallet.wallet_id, *date)?
            .map(|m| DayAccumulator::from_metric(&m))
            .unwrap_or_default();
        acc.merge(delta);
        let metric = derive_metric(&wallet.wallet_id, *date, &acc, wallet.created_at, cfg);
        upsert_metric(&tx, &metric)?;
    }

    let refresh_from = match mode {
        AggregationMode::Backfill { from, .. } => Some(from),
        AggregationMode::Incremental => days.keys().next().copied(),
    };
    if let Some(from) = refresh_from {
        refresh_returning_flags(&tx, &wallet.wallet_id, from)?;
    }

    tx.commit()?;

    metrics::counter!("analytics_events_aggregated_total").increment(report.accepted);
    if report.duplicates > 0 {
        metrics::counter!("analytics_duplicate_events_total").increment(report.duplicates);
    }
    if report.creation_unknown && report.accepted > 0 {
        metrics::counter!("analytics_missing_creation_date_total").increment(1);
        tracing::warn!(
            wallet_id = %wallet.wallet_id,
            "activity for wallet with unknown creation date; days_since_creation left unknown"
        );
    }
    if report.foreign_wallet > 0 {
        tracing::warn!(
            wallet_id = %wallet.wallet_id,
            skipped = report.foreign_wallet,
            "events addressed to another wallet skipped"
        );
    }

    Ok(report)
}

/// Recompute `is_returning` for every stored date on or after `from`.
fn refresh_returning_flags(conn: &Connection, wallet_id: &str, from: NaiveDate) -> Result<()> {
    let from_s = from.to_string();
    let mut seen_active: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM activity_metrics
         WHERE wallet_id = ?1 AND activity_date < ?2 AND is_active = 1)",
        rusqlite::params![wallet_id, from_s],
        |row| row.get(0),
    )?;

    let rows: Vec<(String, bool, bool)> = conn
        .prepare(
            "SELECT activity_date, is_active, is_returning FROM activity_metrics
             WHERE wallet_id = ?1 AND activity_date >= ?2
             ORDER BY activity_date ASC",
        )?
        .query_map(rusqlite::params![wallet_id, from_s], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut update = conn.prepare(
        "UPDATE activity_metrics SET is_returning = ?3
         WHERE wallet_id = ?1 AND activity_date = ?2",
    )?;
    for (date, is_active, is_returning) in rows {
        if is_returning != seen_active {
            update.execute(rusqlite::params![wallet_id, date, seen_active])?;
        }
        seen_active |= is_active;
    }
    Ok(())
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {s:?}"))?
        .with_timezone(&Utc))
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn col_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    s.parse::<NaiveDate>().map_err(|e| conversion_err(idx, e))
}

pub(crate) fn col_ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn col_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    s.parse::<Decimal>().map_err(|e| conversion_err(idx, e))
}

const METRIC_COLUMNS: &str = "wallet_id, activity_date, transaction_count, total_volume, total_fees,
    transfers_count, swaps_count, bridges_count, shielded_count, feature_events_count,
    subtypes_json, first_seen_at, last_seen_at, first_feature_at, is_active, is_returning,
    days_since_creation, sequence_complexity_score";

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityMetric> {
    let subtypes_json: String = row.get(10)?;
    let subtypes: BTreeSet<String> =
        serde_json::from_str(&subtypes_json).map_err(|e| conversion_err(10, e))?;
    Ok(ActivityMetric {
        wallet_id: row.get(0)?,
        activity_date: col_date(row, 1)?,
        transaction_count: row.get(2)?,
        total_volume: col_decimal(row, 3)?,
        total_fees: col_decimal(row, 4)?,
        transfers_count: row.get(5)?,
        swaps_count: row.get(6)?,
        bridges_count: row.get(7)?,
        shielded_count: row.get(8)?,
        feature_events_count: row.get(9)?,
        subtypes,
        first_seen_at: col_ts_opt(row, 11)?,
        last_seen_at: col_ts_opt(row, 12)?,
        first_feature_at: col_ts_opt(row, 13)?,
        is_active: row.get(14)?,
        is_returning: row.get(15)?,
        days_since_creation: row.get(16)?,
        sequence_complexity_score: row.get(17)?,
    })
}

fn load_metric(conn: &Connection, wallet_id: &str, date: NaiveDate) -> Result<Option<ActivityMetric>> {
    let sql = format!(
        "SELECT {METRIC_COLUMNS} FROM activity_metrics WHERE wallet_id = ?1 AND activity_date = ?2"
    );
    Ok(conn
        .query_row(&sql, rusqlite::params![wallet_id, date.to_string()], metric_from_row)
        .optional()?)
}

/// Metrics for one wallet, ordered by date, within an optional inclusive range.
pub fn load_metrics(
    conn: &Connection,
    wallet_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<ActivityMetric>> {
    let sql = format!(
        "SELECT {METRIC_COLUMNS} FROM activity_metrics
         WHERE wallet_id = ?1
           AND (?2 IS NULL OR activity_date >= ?2)
           AND (?3 IS NULL OR activity_date <= ?3)
         ORDER BY activity_date ASC"
    );
    let rows = conn
        .prepare(&sql)?
        .query_map(
            rusqlite::params![
                wallet_id,
                from.map(|d| d.to_string()),
                to.map(|d| d.to_string())
            ],
            metric_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_metric(conn: &Connection, m: &ActivityMetric) -> Result<()> {
    let subtypes_json = serde_json::to_string(&m.subtypes)?;
    conn.execute(
        "INSERT INTO activity_metrics (
            wallet_id, activity_date, transaction_count, total_volume, total_fees,
            transfers_count, swaps_count, bridges_count, shielded_count, feature_events_count,
            subtypes_json, first_seen_at, last_seen_at, first_feature_at, is_active, is_returning,
            days_since_creation, creation_unknown, sequence_complexity_score, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, datetime('now'))
         ON CONFLICT(wallet_id, activity_date) DO UPDATE SET
            transaction_count = excluded.transaction_count,
            total_volume = excluded.total_volume,
            total_fees = excluded.total_fees,
            transfers_count = excluded.transfers_count,
            swaps_count = excluded.swaps_count,
            bridges_count = excluded.bridges_count,
            shielded_count = excluded.shielded_count,
            feature_events_count = excluded.feature_events_count,
            subtypes_json = excluded.subtypes_json,
            first_seen_at = excluded.first_seen_at,
            last_seen_at = excluded.last_seen_at,
            first_feature_at = excluded.first_feature_at,
            is_active = excluded.is_active,
            days_since_creation = excluded.days_since_creation,
            creation_unknown = excluded.creation_unknown,
            sequence_complexity_score = excluded.sequence_complexity_score,
            updated_at = excluded.updated_at",
        rusqlite::params![
            m.wallet_id,
            m.activity_date.to_string(),
            m.transaction_count,
            m.total_volume.to_string(),
            m.total_fees.to_string(),
            m.transfers_count,
            m.swaps_count,
            m.bridges_count,
            m.shielded_count,
            m.feature_events_count,
            subtypes_json,
            m.first_seen_at.map(ts_to_sql),
            m.last_seen_at.map(ts_to_sql),
            m.first_feature_at.map(ts_to_sql),
            m.is_active,
            m.is_returning,
            m.days_since_creation,
            m.days_since_creation.is_none(),
            m.sequence_complexity_score,
        ],
    )?;
    Ok(())
}

/// Fill in `days_since_creation` once a wallet's creation date becomes known.
pub fn resolve_creation_date(
    conn: &Connection,
    wallet_id: &str,
    created_at: DateTime<Utc>,
) -> Result<usize> {
    let created = created_at.date_naive().to_string();
    let n = conn.execute(
        "UPDATE activity_metrics
         SET days_since_creation = MAX(0, CAST(julianday(activity_date) - julianday(?2) AS INTEGER)),
             creation_unknown = 0,
             updated_at = datetime('now')
         WHERE wallet_id = ?1 AND creation_unknown = 1",
        rusqlite::params![wallet_id, created],
    )?;
    Ok(n)
}
