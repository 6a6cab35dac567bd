//! Cohort assignment and retention.
//!
//! Periods are half-open `[period_start, next_period_start)` in UTC. Weekly
//! periods open on ISO Monday, monthly periods on the first of the month.
//! Retention values are a pure function of `cohort_assignments` and
//! `activity_metrics`; `cohort_retention` is only a cache of them.

use anyhow::Result;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use common::error::AnalyticsError;
use common::types::{CohortType, Ratio, TxType};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::activity::col_date;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cohort {
    pub cohort_id: i64,
    pub cohort_type: CohortType,
    pub period_start: NaiveDate,
    pub wallet_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionPoint {
    pub offset: u32,
    /// Percentage in [0, 100].
    pub retention_pct: f64,
    pub active_wallets: u32,
    /// The period has not fully elapsed, or some member's metrics lag behind it.
    pub preliminary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortRetention {
    pub cohort: Cohort,
    /// Empty when the cohort has no members; see [`Self::retention`].
    pub points: Vec<RetentionPoint>,
}

impl CohortRetention {
    /// Retention at `offset` as a fraction-of-100, or insufficient data for an empty cohort.
    pub fn retention(&self, offset: u32) -> Ratio {
        if self.cohort.wallet_count == 0 {
            return Ratio::INSUFFICIENT;
        }
        self.points
            .iter()
            .find(|p| p.offset == offset)
            .map_or(Ratio::INSUFFICIENT, |p| Ratio::Value(p.retention_pct))
    }

    fn stable_point(&self, offset: u32) -> Option<&RetentionPoint> {
        self.points
            .iter()
            .find(|p| p.offset == offset && !p.preliminary)
    }
}

/// Activity snapshot for one cohort member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberActivity {
    pub active_dates: BTreeSet<NaiveDate>,
    /// Last date the aggregator has fully processed for this wallet.
    pub metrics_through: Option<NaiveDate>,
}

pub fn period_start(ts: DateTime<Utc>, cohort_type: CohortType) -> NaiveDate {
    let date = ts.date_naive();
    match cohort_type {
        CohortType::Weekly => {
            date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday()))
        }
        CohortType::Monthly => date.with_day(1).unwrap_or(date),
    }
}

/// Start of the period `k` periods after `start`.
pub fn offset_start(start: NaiveDate, cohort_type: CohortType, k: u32) -> NaiveDate {
    match cohort_type {
        CohortType::Weekly => start + chrono::Duration::weeks(i64::from(k)),
        CohortType::Monthly => start
            .checked_add_months(Months::new(k))
            .unwrap_or(NaiveDate::MAX),
    }
}

/// Half-open date range `[begin, end)` of offset period `k`.
pub fn offset_range(start: NaiveDate, cohort_type: CohortType, k: u32) -> (NaiveDate, NaiveDate) {
    (
        offset_start(start, cohort_type, k),
        offset_start(start, cohort_type, k + 1),
    )
}

pub fn compute_retention(
    cohort_type: CohortType,
    start: NaiveDate,
    members: &BTreeMap<String, MemberActivity>,
    as_of: NaiveDate,
    max_offset: u32,
) -> Vec<RetentionPoint> {
    if members.is_empty() {
        return Vec::new();
    }
    let size = members.len() as f64;

    (1..=max_offset)
        .map(|k| {
            let (begin, end) = offset_range(start, cohort_type, k);
            let last_day = end.pred_opt().unwrap_or(begin);

            let active = members
                .values()
                .filter(|m| {
                    m.active_dates
                        .range(begin..end)
                        .any(|d| *d <= as_of)
                })
                .count();

            let elapsed = as_of >= last_day;
            let synced = members
                .values()
                .all(|m| m.metrics_through.is_some_and(|t| t >= last_day));

            RetentionPoint {
                offset: k,
                retention_pct: (active as f64 / size * 100.0).clamp(0.0, 100.0),
                active_wallets: u32::try_from(active).unwrap_or(u32::MAX),
                preliminary: !(elapsed && synced),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionTrend {
    pub offset: u32,
    pub latest_period: NaiveDate,
    pub previous_period: NaiveDate,
    pub latest_pct: f64,
    pub previous_pct: f64,
    /// Percentage points.
    pub delta: f64,
    pub significant: bool,
}

/// Period-over-period retention deltas.
///
/// For each offset the two most recent cohorts with a stable (non-preliminary)
/// value are compared, so a still-open period never reads as a collapse.
pub fn detect_trends(
    cohorts: &[CohortRetention],
    max_offset: u32,
    threshold_pct: f64,
) -> Vec<RetentionTrend> {
    let mut sorted: Vec<&CohortRetention> = cohorts
        .iter()
        .filter(|c| c.cohort.wallet_count > 0)
        .collect();
    sorted.sort_by_key(|c| c.cohort.period_start);

    (1..=max_offset)
        .filter_map(|k| {
            let mut stable = sorted
                .iter()
                .rev()
                .filter_map(|c| c.stable_point(k).map(|p| (c.cohort.period_start, p)));
            let (latest_period, latest) = stable.next()?;
            let (previous_period, previous) = stable.next()?;
            let delta = latest.retention_pct - previous.retention_pct;
            Some(RetentionTrend {
                offset: k,
                latest_period,
                previous_period,
                latest_pct: latest.retention_pct,
                previous_pct: previous.retention_pct,
                delta,
                significant: delta.abs() >= threshold_pct,
            })
        })
        .collect()
}

/// Per-wallet transaction counts by tracked type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMix {
    pub counts: BTreeMap<TxType, u64>,
}

impl TypeMix {
    /// The type with the most transactions; ties go to the earlier tracked type.
    pub fn dominant(&self) -> Option<TxType> {
        let mut best: Option<(TxType, u64)> = None;
        for t in TxType::TRACKED {
            let n = self.counts.get(&t).copied().unwrap_or(0);
            if n > 0 && best.is_none_or(|(_, b)| n > b) {
                best = Some((t, n));
            }
        }
        best.map(|(t, _)| t)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeCorrelation {
    pub tx_type: TxType,
    pub wallets: u32,
    /// Retention (percent) of wallets whose mix is dominated by this type.
    pub retention_pct: Ratio,
    pub baseline_pct: Ratio,
    /// Percentage points above (or below) the cohort baseline. A correlation signal only.
    pub delta_pct: Ratio,
}

pub fn correlate_type_mix(members: &[(TypeMix, bool)]) -> Vec<TypeCorrelation> {
    let retained_total = members.iter().filter(|(_, r)| *r).count();
    let baseline = Ratio::of(retained_total as f64, members.len() as f64).map(|v| v * 100.0);

    TxType::TRACKED
        .into_iter()
        .map(|t| {
            let group: Vec<bool> = members
                .iter()
                .filter(|(mix, _)| mix.dominant() == Some(t))
                .map(|(_, r)| *r)
                .collect();
            let retained = group.iter().filter(|r| **r).count();
            let rate = Ratio::of(retained as f64, group.len() as f64).map(|v| v * 100.0);
            let delta = match (rate.value(), baseline.value()) {
                (Some(r), Some(b)) => Ratio::Value(r - b),
                _ => Ratio::INSUFFICIENT,
            };
            TypeCorrelation {
                tx_type: t,
                wallets: u32::try_from(group.len()).unwrap_or(u32::MAX),
                retention_pct: rate,
                baseline_pct: baseline,
                delta_pct: delta,
            }
        })
        .collect()
}

fn cohort_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cohort> {
    let t: String = row.get(1)?;
    let cohort_type = CohortType::parse(&t).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Cohort {
        cohort_id: row.get(0)?,
        cohort_type,
        period_start: col_date(row, 2)?,
        wallet_count: row.get(3)?,
    })
}

pub fn load_cohort(conn: &Connection, cohort_id: i64) -> Result<Option<Cohort>> {
    Ok(conn
        .query_row(
            "SELECT cohort_id, cohort_type, period_start, wallet_count FROM cohorts WHERE cohort_id = ?1",
            [cohort_id],
            cohort_from_row,
        )
        .optional()?)
}

/// Assign a wallet to its cohort of `cohort_type`. The first assignment wins and is
/// never changed; later calls return the existing cohort.
pub fn assign_cohort(
    conn: &mut Connection,
    wallet_id: &str,
    created_at: DateTime<Utc>,
    cohort_type: CohortType,
) -> Result<Cohort> {
    let start = period_start(created_at, cohort_type);
    let tx = conn.transaction()?;

    let existing: Option<Cohort> = tx
        .query_row(
            "SELECT c.cohort_id, c.cohort_type, c.period_start, c.wallet_count
             FROM cohort_assignments ca JOIN cohorts c ON c.cohort_id = ca.cohort_id
             WHERE ca.wallet_id = ?1 AND ca.cohort_type = ?2",
            rusqlite::params![wallet_id, cohort_type.as_str()],
            cohort_from_row,
        )
        .optional()?;
    if let Some(cohort) = existing {
        if cohort.period_start != start {
            tracing::warn!(
                wallet_id,
                cohort_type = cohort_type.as_str(),
                assigned = %cohort.period_start,
                implied = %start,
                "cohort assignment is immutable; ignoring changed creation date"
            );
        }
        return Ok(cohort);
    }

    tx.execute(
        "INSERT OR IGNORE INTO cohorts (cohort_type, period_start) VALUES (?1, ?2)",
        rusqlite::params![cohort_type.as_str(), start.to_string()],
    )?;
    let cohort_id: i64 = tx.query_row(
        "SELECT cohort_id FROM cohorts WHERE cohort_type = ?1 AND period_start = ?2",
        rusqlite::params![cohort_type.as_str(), start.to_string()],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO cohort_assignments (wallet_id, cohort_id, cohort_type) VALUES (?1, ?2, ?3)",
        rusqlite::params![wallet_id, cohort_id, cohort_type.as_str()],
    )?;
    tx.execute(
        "UPDATE cohorts SET
            wallet_count = (SELECT COUNT(*) FROM cohort_assignments WHERE cohort_id = ?1),
            updated_at = datetime('now')
         WHERE cohort_id = ?1",
        [cohort_id],
    )?;
    let cohort = tx.query_row(
        "SELECT cohort_id, cohort_type, period_start, wallet_count FROM cohorts WHERE cohort_id = ?1",
        [cohort_id],
        cohort_from_row,
    )?;
    tx.commit()?;

    tracing::debug!(wallet_id, cohort_id, cohort_type = cohort_type.as_str(), "wallet assigned to cohort");
    Ok(cohort)
}

pub fn assign_all_cohorts(
    conn: &mut Connection,
    wallet_id: &str,
    created_at: DateTime<Utc>,
) -> Result<Vec<Cohort>> {
    CohortType::ALL
        .into_iter()
        .map(|t| assign_cohort(conn, wallet_id, created_at, t))
        .collect()
}

pub fn cohort_for_wallet(
    conn: &Connection,
    wallet_id: &str,
    cohort_type: CohortType,
) -> Result<Option<Cohort>> {
    Ok(conn
        .query_row(
            "SELECT c.cohort_id, c.cohort_type, c.period_start, c.wallet_count
             FROM cohort_assignments ca JOIN cohorts c ON c.cohort_id = ca.cohort_id
             WHERE ca.wallet_id = ?1 AND ca.cohort_type = ?2",
            rusqlite::params![wallet_id, cohort_type.as_str()],
            cohort_from_row,
        )
        .optional()?)
}

/// Cohorts of a type whose period starts within the inclusive range.
pub fn load_cohorts(
    conn: &Connection,
    cohort_type: CohortType,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<Cohort>> {
    let rows = conn
        .prepare(
            "SELECT cohort_id, cohort_type, period_start, wallet_count FROM cohorts
             WHERE cohort_type = ?1
               AND (?2 IS NULL OR period_start >= ?2)
               AND (?3 IS NULL OR period_start <= ?3)
             ORDER BY period_start ASC",
        )?
        .query_map(
            rusqlite::params![
                cohort_type.as_str(),
                from.map(|d| d.to_string()),
                to.map(|d| d.to_string())
            ],
            cohort_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_members(
    conn: &Connection,
    cohort: &Cohort,
    max_offset: u32,
) -> Result<BTreeMap<String, MemberActivity>> {
    let mut members: BTreeMap<String, MemberActivity> = BTreeMap::new();

    let rows: Vec<(String, Option<String>)> = conn
        .prepare(
            "SELECT ca.wallet_id, ws.metrics_through
             FROM cohort_assignments ca
             LEFT JOIN wallet_sync ws ON ws.wallet_id = ca.wallet_id
             WHERE ca.cohort_id = ?1",
        )?
        .query_map([cohort.cohort_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (wallet_id, through) in rows {
        let metrics_through = through.and_then(|s| s.parse::<NaiveDate>().ok());
        members.insert(
            wallet_id,
            MemberActivity {
                active_dates: BTreeSet::new(),
                metrics_through,
            },
        );
    }

    let (begin, _) = offset_range(cohort.period_start, cohort.cohort_type, 1);
    let (_, end) = offset_range(cohort.period_start, cohort.cohort_type, max_offset);
    let mut stmt = conn.prepare(
        "SELECT ca.wallet_id, am.activity_date
         FROM cohort_assignments ca
         JOIN activity_metrics am ON am.wallet_id = ca.wallet_id
         WHERE ca.cohort_id = ?1 AND am.is_active = 1
           AND am.activity_date >= ?2 AND am.activity_date < ?3",
    )?;
    let active = stmt.query_map(
        rusqlite::params![cohort.cohort_id, begin.to_string(), end.to_string()],
        |row| Ok((row.get::<_, String>(0)?, col_date(row, 1)?)),
    )?;
    for r in active {
        let (wallet_id, date) = r?;
        if let Some(m) = members.get_mut(&wallet_id) {
            m.active_dates.insert(date);
        }
    }
    Ok(members)
}

/// Recompute and cache retention for one cohort as of `as_of`.
pub fn recompute_cohort(
    conn: &mut Connection,
    cohort: &Cohort,
    as_of: NaiveDate,
    max_offset: u32,
) -> Result<CohortRetention> {
    let members = load_members(conn, cohort, max_offset)?;
    let points = compute_retention(cohort.cohort_type, cohort.period_start, &members, as_of, max_offset);
    let wallet_count = u32::try_from(members.len()).unwrap_or(u32::MAX);

    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE cohorts SET wallet_count = ?2, updated_at = datetime('now') WHERE cohort_id = ?1",
        rusqlite::params![cohort.cohort_id, wallet_count],
    )?;
    tx.execute(
        "DELETE FROM cohort_retention WHERE cohort_id = ?1",
        [cohort.cohort_id],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO cohort_retention
                (cohort_id, offset_k, retention_pct, active_wallets, is_preliminary, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for p in &points {
            insert.execute(rusqlite::params![
                cohort.cohort_id,
                p.offset,
                p.retention_pct,
                p.active_wallets,
                p.preliminary,
                as_of.to_string()
            ])?;
        }
    }
    tx.commit()?;

    for p in &points {
        metrics::gauge!(
            "analytics_cohort_retention_pct",
            "cohort_type" => cohort.cohort_type.as_str(),
            "offset" => p.offset.to_string()
        )
        .set(p.retention_pct);
    }

    Ok(CohortRetention {
        cohort: Cohort {
            wallet_count,
            ..cohort.clone()
        },
        points,
    })
}

/// Cached retention as last stored by [`recompute_cohort`].
pub fn load_retention(conn: &Connection, cohort: &Cohort) -> Result<CohortRetention> {
    let points = conn
        .prepare(
            "SELECT offset_k, retention_pct, active_wallets, is_preliminary
             FROM cohort_retention WHERE cohort_id = ?1 ORDER BY offset_k ASC",
        )?
        .query_map([cohort.cohort_id], |row| {
            Ok(RetentionPoint {
                offset: row.get(0)?,
                retention_pct: row.get(1)?,
                active_wallets: row.get(2)?,
                preliminary: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(CohortRetention {
        cohort: cohort.clone(),
        points,
    })
}

/// Type-mix vs retention correlation for one cohort at `offset` (1-based).
pub fn cohort_type_correlation(
    conn: &Connection,
    cohort: &Cohort,
    offset: u32,
    as_of: NaiveDate,
) -> Result<Vec<TypeCorrelation>> {
    if offset == 0 {
        return Err(AnalyticsError::InvalidOffset { offset }.into());
    }
    let members = load_members(conn, cohort, offset)?;
    let (begin, end) = offset_range(cohort.period_start, cohort.cohort_type, offset);

    let mut mixes: BTreeMap<String, TypeMix> = BTreeMap::new();
    let rows = conn
        .prepare(
            "SELECT ca.wallet_id,
                    SUM(am.transfers_count), SUM(am.swaps_count),
                    SUM(am.bridges_count), SUM(am.shielded_count)
             FROM cohort_assignments ca
             JOIN activity_metrics am ON am.wallet_id = ca.wallet_id
             WHERE ca.cohort_id = ?1 AND am.activity_date <= ?2
             GROUP BY ca.wallet_id",
        )?
        .query_map(rusqlite::params![cohort.cohort_id, as_of.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                [
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ],
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (wallet_id, counts) in rows {
        let mix = mixes.entry(wallet_id).or_default();
        for (t, n) in TxType::TRACKED.into_iter().zip(counts) {
            mix.counts.insert(t, u64::try_from(n).unwrap_or(0));
        }
    }

    let sample: Vec<(TypeMix, bool)> = members
        .iter()
        .map(|(wallet_id, m)| {
            let retained = m.active_dates.range(begin..end).any(|d| *d <= as_of);
            (mixes.remove(wallet_id).unwrap_or_default(), retained)
        })
        .collect();
    Ok(correlate_type_mix(&sample))
}

/// Weekly cohort retention at offset 1 for the wallet's own cohort, when stable.
pub fn wallet_retention_context(conn: &Connection, wallet_id: &str) -> Result<Option<f64>> {
    Ok(conn
        .query_row(
            "SELECT cr.retention_pct
             FROM cohort_assignments ca
             JOIN cohort_retention cr ON cr.cohort_id = ca.cohort_id
             WHERE ca.wallet_id = ?1 AND ca.cohort_type = 'weekly'
               AND cr.offset_k = 1 AND cr.is_preliminary = 0",
            [wallet_id],
            |row| row.get(0),
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::{event, ts, wallet};
    use crate::activity::{aggregate, AggregationMode};
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekly_boundaries() {
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sunday_late = Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap();
        let monday_plus = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let next_monday = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();

        assert_eq!(period_start(monday, CohortType::Weekly), d(2024, 1, 1));
        assert_eq!(
            period_start(sunday_late, CohortType::Weekly),
            period_start(monday_plus, CohortType::Weekly)
        );
        assert_eq!(period_start(next_monday, CohortType::Weekly), d(2024, 1, 8));
    }

    #[test]
    fn test_monthly_boundaries() {
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(period_start(first, CohortType::Monthly), d(2024, 3, 1));
        assert_eq!(period_start(last, CohortType::Monthly), d(2024, 2, 1));
        assert_eq!(offset_range(d(2024, 1, 1), CohortType::Monthly, 1), (d(2024, 2, 1), d(2024, 3, 1)));
    }

    fn members_with(active_in_week1: usize, total: usize, through: NaiveDate) -> BTreeMap<String, MemberActivity> {
        (0..total)
            .map(|i| {
                let mut m = MemberActivity {
                    active_dates: BTreeSet::new(),
                    metrics_through: Some(through),
                };
                if i < active_in_week1 {
                    m.active_dates.insert(d(2024, 1, 9));
                }
                (format!("w{i:03}"), m)
            })
            .collect()
    }

    #[test]
    fn test_retention_forty_of_hundred() {
        let members = members_with(40, 100, d(2024, 3, 1));
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &members, d(2024, 3, 1), 4);
        assert_eq!(points.len(), 4);
        assert!((points[0].retention_pct - 40.0).abs() < 1e-9);
        assert_eq!(points[0].active_wallets, 40);
        assert!(!points[0].preliminary);
        for p in &points[1..] {
            assert!(p.retention_pct.abs() < 1e-9, "no data yet means 0, not missing");
        }
        for p in &points {
            assert!((0.0..=100.0).contains(&p.retention_pct));
        }
    }

    #[test]
    fn test_empty_cohort_is_insufficient_data() {
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &BTreeMap::new(), d(2024, 3, 1), 4);
        assert!(points.is_empty());
        let r = CohortRetention {
            cohort: Cohort {
                cohort_id: 1,
                cohort_type: CohortType::Weekly,
                period_start: d(2024, 1, 1),
                wallet_count: 0,
            },
            points,
        };
        assert_eq!(r.retention(1), Ratio::INSUFFICIENT);
    }

    #[test]
    fn test_preliminary_until_period_elapsed_and_synced() {
        // as_of inside week 1.
        let members = members_with(1, 2, d(2024, 1, 10));
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &members, d(2024, 1, 10), 1);
        assert!(points[0].preliminary);

        // Period elapsed but one member's metrics lag.
        let mut members = members_with(1, 2, d(2024, 1, 31));
        members.get_mut("w001").unwrap().metrics_through = Some(d(2024, 1, 12));
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &members, d(2024, 1, 31), 1);
        assert!(points[0].preliminary);

        let members = members_with(1, 2, d(2024, 1, 14));
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &members, d(2024, 1, 14), 1);
        assert!(!points[0].preliminary);
    }

    #[test]
    fn test_activity_after_as_of_ignored() {
        let members = members_with(1, 1, d(2024, 3, 1));
        let points = compute_retention(CohortType::Weekly, d(2024, 1, 1), &members, d(2024, 1, 8), 1);
        assert!(points[0].retention_pct.abs() < 1e-9);
    }

    #[test]
    fn test_assignment_is_immutable_and_counts_members() {
        let mut conn = common::db::open_memory().unwrap();
        let a = assign_cohort(&mut conn, "w1", ts(2024, 1, 1, 0), CohortType::Weekly).unwrap();
        let b = assign_cohort(&mut conn, "w2", ts(2024, 1, 7, 23), CohortType::Weekly).unwrap();
        assert_eq!(a.cohort_id, b.cohort_id);
        assert_eq!(b.wallet_count, 2);

        // A changed creation date does not move the wallet.
        let again = assign_cohort(&mut conn, "w1", ts(2024, 2, 1, 0), CohortType::Weekly).unwrap();
        assert_eq!(again.cohort_id, a.cohort_id);
        assert_eq!(again.period_start, d(2024, 1, 1));

        let all = assign_all_cohorts(&mut conn, "w3", ts(2024, 1, 15, 0)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].period_start, d(2024, 1, 1));
    }

    #[test]
    fn test_recompute_cohort_from_metrics_is_deterministic() {
        let mut conn = common::db::open_memory().unwrap();
        let cfg = crate::activity::tests::cfg();
        for i in 0..4 {
            let id = format!("w{i}");
            assign_all_cohorts(&mut conn, &id, ts(2024, 1, 2, 0)).unwrap();
            if i < 3 {
                let ev = event(&id, "t", ts(2024, 1, 9, 1), common::types::TxType::Swap, 1);
                aggregate(&mut conn, &wallet(&id, Some(ts(2024, 1, 2, 0))), &[ev], AggregationMode::Incremental, &cfg).unwrap();
            }
            conn.execute(
                "INSERT INTO wallet_sync (wallet_id, metrics_through) VALUES (?1, '2024-03-01')",
                [&id],
            )
            .unwrap();
        }
        let cohort = cohort_for_wallet(&conn, "w0", CohortType::Weekly).unwrap().unwrap();
        let first = recompute_cohort(&mut conn, &cohort, d(2024, 3, 1), 4).unwrap();
        let second = recompute_cohort(&mut conn, &cohort, d(2024, 3, 1), 4).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.retention(1), Ratio::Value(75.0));
        assert_eq!(load_retention(&conn, &cohort).unwrap().points, first.points);
        assert_eq!(wallet_retention_context(&conn, "w3").unwrap(), Some(75.0));
    }

    #[test]
    fn test_cohort_type_correlation_from_stored_activity() {
        use common::types::TxType;
        let mut conn = common::db::open_memory().unwrap();
        let cfg = crate::activity::tests::cfg();
        let plan = [
            ("w0", TxType::Swap, ts(2024, 1, 9, 1)),
            ("w1", TxType::Swap, ts(2024, 1, 10, 1)),
            ("w2", TxType::Transfer, ts(2024, 1, 3, 1)),
            ("w3", TxType::Transfer, ts(2024, 1, 11, 1)),
        ];
        for (id, t, at) in plan {
            assign_all_cohorts(&mut conn, id, ts(2024, 1, 2, 0)).unwrap();
            let w = wallet(id, Some(ts(2024, 1, 2, 0)));
            aggregate(&mut conn, &w, &[event(id, "t", at, t, 1)], AggregationMode::Incremental, &cfg).unwrap();
        }
        let cohort = cohort_for_wallet(&conn, "w0", CohortType::Weekly).unwrap().unwrap();

        let out = cohort_type_correlation(&conn, &cohort, 1, d(2024, 3, 1)).unwrap();
        let swap = out.iter().find(|c| c.tx_type == TxType::Swap).unwrap();
        assert_eq!(swap.wallets, 2);
        assert_eq!(swap.baseline_pct, Ratio::Value(75.0));
        assert_eq!(swap.delta_pct, Ratio::Value(25.0));
        let transfer = out.iter().find(|c| c.tx_type == TxType::Transfer).unwrap();
        assert_eq!(transfer.retention_pct, Ratio::Value(50.0));

        let err = cohort_type_correlation(&conn, &cohort, 0, d(2024, 3, 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalyticsError>(),
            Some(AnalyticsError::InvalidOffset { offset: 0 })
        ));
    }

    fn cohort_with(start: NaiveDate, pct: f64, preliminary: bool) -> CohortRetention {
        CohortRetention {
            cohort: Cohort {
                cohort_id: 0,
                cohort_type: CohortType::Weekly,
                period_start: start,
                wallet_count: 10,
            },
            points: vec![RetentionPoint {
                offset: 1,
                retention_pct: pct,
                active_wallets: 0,
                preliminary,
            }],
        }
    }

    #[test]
    fn test_trend_flags_significant_drop_and_skips_preliminary() {
        let cohorts = vec![
            cohort_with(d(2024, 1, 1), 50.0, false),
            cohort_with(d(2024, 1, 8), 38.0, false),
            cohort_with(d(2024, 1, 15), 0.0, true),
        ];
        let trends = detect_trends(&cohorts, 4, 10.0);
        assert_eq!(trends.len(), 1);
        let t = &trends[0];
        assert_eq!(t.latest_period, d(2024, 1, 8));
        assert!((t.delta + 12.0).abs() < 1e-9);
        assert!(t.significant);

        let small = detect_trends(&cohorts[..2], 4, 15.0);
        assert!(!small[0].significant);
    }

    #[test]
    fn test_type_mix_correlation() {
        let mix = |t: TxType, n: u64| TypeMix {
            counts: BTreeMap::from([(t, n)]),
        };
        let sample = vec![
            (mix(TxType::Swap, 5), true),
            (mix(TxType::Swap, 2), true),
            (mix(TxType::Transfer, 9), false),
            (mix(TxType::Transfer, 1), true),
        ];
        let out = correlate_type_mix(&sample);
        let swap = out.iter().find(|c| c.tx_type == TxType::Swap).unwrap();
        assert_eq!(swap.retention_pct, Ratio::Value(100.0));
        assert_eq!(swap.baseline_pct, Ratio::Value(75.0));
        assert_eq!(swap.delta_pct, Ratio::Value(25.0));
        let bridge = out.iter().find(|c| c.tx_type == TxType::Bridge).unwrap();
        assert_eq!(bridge.wallets, 0);
        assert_eq!(bridge.delta_pct, Ratio::INSUFFICIENT);
    }

    #[test]
    fn test_dominant_type_tie_break() {
        let mix = TypeMix {
            counts: BTreeMap::from([(TxType::Swap, 3), (TxType::Transfer, 3)]),
        };
        assert_eq!(mix.dominant(), Some(TxType::Transfer));
        assert_eq!(TypeMix::default().dominant(), None);
    }
}
