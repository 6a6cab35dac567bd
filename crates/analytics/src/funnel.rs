//! Adoption funnel: five ordered stages, one nullable timestamp each.
//!
//! A stage is only evaluated once its predecessor is achieved, and its
//! `achieved_at` is clipped forward to the predecessor's. Stored timestamps are
//! first-write-wins, so re-evaluating with any `as_of` never rewinds a stage.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config::Funnel as FunnelConfig;
use common::types::{FunnelStage, Ratio, WalletInfo};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::activity::{col_ts_opt, load_metrics, ts_to_sql, ActivityMetric};

pub const STAGE_COUNT: usize = FunnelStage::ALL.len();

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunnelState {
    pub wallet_id: String,
    pub achieved: [Option<DateTime<Utc>>; STAGE_COUNT],
}

impl FunnelState {
    pub fn new(wallet_id: &str) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            achieved: [None; STAGE_COUNT],
        }
    }

    pub fn achieved_at(&self, stage: FunnelStage) -> Option<DateTime<Utc>> {
        self.achieved[stage.index()]
    }

    /// Furthest stage reached, if any.
    pub fn current_stage(&self) -> Option<FunnelStage> {
        FunnelStage::ALL
            .into_iter()
            .rev()
            .find(|s| self.achieved[s.index()].is_some())
    }

    /// Achieved stages past `created`, or `created` itself, counted as reached.
    pub fn reached(&self, stage: FunnelStage) -> bool {
        self.achieved[stage.index()].is_some()
            || FunnelStage::ALL[stage.index() + 1..]
                .iter()
                .any(|s| self.achieved[s.index()].is_some())
    }

    /// Set timestamps never decrease in stage order.
    pub fn is_ordered(&self) -> bool {
        let set: Vec<DateTime<Utc>> = self.achieved.iter().flatten().copied().collect();
        set.windows(2).all(|w| w[0] <= w[1])
    }

    pub fn time_to_achieve_hours(
        &self,
        stage: FunnelStage,
        created_at: Option<DateTime<Utc>>,
    ) -> Option<f64> {
        let achieved = self.achieved_at(stage)?;
        let created = created_at?;
        Some((achieved - created).num_seconds() as f64 / 3600.0)
    }
}

/// Earliest timestamp at which each stage's predicate held, ignoring stage order.
pub type Evidence = [Option<DateTime<Utc>>; STAGE_COUNT];

fn held(ts: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> Option<DateTime<Utc>> {
    ts.filter(|t| *t <= as_of)
}

/// Evaluate every predicate against the metrics visible at `as_of`.
///
/// Only days on or before `as_of`'s date count. On the `as_of` day itself a
/// predicate holds only if its timestamp is not after `as_of`; the day's volume
/// counts once its last transaction is.
pub fn collect_evidence(
    created_at: Option<DateTime<Utc>>,
    metrics: &[ActivityMetric],
    as_of: DateTime<Utc>,
    cfg: &FunnelConfig,
) -> Evidence {
    let mut evidence: Evidence = [None; STAGE_COUNT];
    let cutoff = as_of.date_naive();

    let mut days: Vec<&ActivityMetric> = metrics
        .iter()
        .filter(|m| m.is_active)
        .filter(|m| m.activity_date < cutoff || held(m.first_seen_at, as_of).is_some())
        .collect();
    days.sort_by_key(|m| m.activity_date);

    evidence[FunnelStage::Created.index()] = held(created_at, as_of);

    evidence[FunnelStage::FirstTx.index()] = days.first().and_then(|m| held(m.first_seen_at, as_of));

    evidence[FunnelStage::FeatureUsage.index()] = days
        .iter()
        .filter(|m| m.has_feature_usage())
        .find_map(|m| {
            let at = if m.activity_date < cutoff {
                m.first_feature_at.or(m.first_seen_at)
            } else {
                m.first_feature_at
            };
            held(at, as_of)
        });

    let need = cfg.recurring_min_days.max(1) as usize;
    let window = i64::from(cfg.recurring_window_days.max(1));
    evidence[FunnelStage::Recurring.index()] = (need - 1..days.len())
        .find(|&j| (days[j].activity_date - days[j + 1 - need].activity_date).num_days() < window)
        .and_then(|j| held(days[j].first_seen_at, as_of));

    let threshold = Decimal::try_from(cfg.high_value_volume_threshold).unwrap_or(Decimal::MAX);
    let mut cumulative = Decimal::ZERO;
    for m in &days {
        let complete = m.activity_date < cutoff || held(m.last_seen_at, as_of).is_some();
        if !complete {
            break;
        }
        cumulative += m.total_volume;
        if cumulative > threshold {
            evidence[FunnelStage::HighValue.index()] = held(m.last_seen_at, as_of);
            break;
        }
    }

    evidence
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageAdvance {
    pub stage: FunnelStage,
    pub raw_at: DateTime<Utc>,
    pub achieved_at: DateTime<Utc>,
}

impl StageAdvance {
    pub fn clipped(&self) -> bool {
        self.achieved_at != self.raw_at
    }
}

/// Apply evidence to a state. Returns the new state and the stages newly set.
///
/// When the creation date is unknown the `created` stage stays unset and does
/// not gate `first_tx`. Once it resolves after later stages were recorded,
/// `created` takes the earlier of the creation time and `first_tx`.
pub fn advance(state: &FunnelState, evidence: &Evidence) -> (FunnelState, Vec<StageAdvance>) {
    let mut next = state.clone();
    let mut advanced = Vec::new();
    let mut prev: Option<DateTime<Utc>> = None;

    for stage in FunnelStage::ALL {
        let i = stage.index();
        if let Some(at) = next.achieved[i] {
            prev = Some(at);
            continue;
        }
        let Some(raw) = evidence[i] else {
            if stage == FunnelStage::Created {
                continue;
            }
            break;
        };
        if stage != FunnelStage::Created && stage != FunnelStage::FirstTx && prev.is_none() {
            break;
        }

        let achieved_at = if stage == FunnelStage::Created {
            let later = next.achieved[i + 1..].iter().flatten().min().copied();
            later.map_or(raw, |l| raw.min(l))
        } else {
            prev.map_or(raw, |p| raw.max(p))
        };

        next.achieved[i] = Some(achieved_at);
        advanced.push(StageAdvance {
            stage,
            raw_at: raw,
            achieved_at,
        });
        prev = Some(achieved_at);
    }

    (next, advanced)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelEvaluation {
    pub state: FunnelState,
    pub advanced: Vec<StageAdvance>,
}

pub fn load_state(conn: &Connection, wallet_id: &str) -> Result<FunnelState> {
    let mut state = FunnelState::new(wallet_id);
    let mut stmt = conn.prepare(
        "SELECT stage_index, achieved_at FROM funnel_states
         WHERE wallet_id = ?1 AND achieved_at IS NOT NULL",
    )?;
    let rows = stmt.query_map([wallet_id], |row| {
        Ok((row.get::<_, usize>(0)?, col_ts_opt(row, 1)?))
    })?;
    for r in rows {
        let (idx, at) = r?;
        if idx < STAGE_COUNT {
            state.achieved[idx] = at;
        }
    }
    Ok(state)
}

fn persist_advances(conn: &Connection, wallet_id: &str, advanced: &[StageAdvance]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO funnel_states (wallet_id, stage, stage_index, achieved_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(wallet_id, stage) DO UPDATE SET
            achieved_at = COALESCE(funnel_states.achieved_at, excluded.achieved_at),
            updated_at = excluded.updated_at",
    )?;
    for a in advanced {
        stmt.execute(rusqlite::params![
            wallet_id,
            a.stage.as_str(),
            a.stage.index(),
            ts_to_sql(a.achieved_at)
        ])?;
    }
    Ok(())
}

/// Evaluate and persist the funnel for one wallet as of `as_of`.
pub fn evaluate(
    conn: &mut Connection,
    wallet: &WalletInfo,
    as_of: DateTime<Utc>,
    cfg: &FunnelConfig,
) -> Result<FunnelEvaluation> {
    let tx = conn.transaction()?;
    let state = load_state(&tx, &wallet.wallet_id)?;
    let metrics = load_metrics(&tx, &wallet.wallet_id, None, Some(as_of.date_naive()))?;
    let evidence = collect_evidence(wallet.created_at, &metrics, as_of, cfg);
    let (next, advanced) = advance(&state, &evidence);
    persist_advances(&tx, &wallet.wallet_id, &advanced)?;
    tx.commit()?;

    for a in &advanced {
        metrics::counter!("analytics_funnel_stage_reached_total", "stage" => a.stage.as_str())
            .increment(1);
        if a.clipped() {
            metrics::counter!("analytics_funnel_stage_anomalies_total", "stage" => a.stage.as_str())
                .increment(1);
            tracing::warn!(
                wallet_id = %wallet.wallet_id,
                stage = a.stage.as_str(),
                raw_at = %a.raw_at,
                achieved_at = %a.achieved_at,
                "stage predicate satisfied out of order; achieved_at clipped"
            );
        }
    }
    debug_assert!(next.is_ordered());

    Ok(FunnelEvaluation {
        state: next,
        advanced,
    })
}

/// Restricts the population before funnel ratios are computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentFilter {
    pub cohort_id: Option<i64>,
    pub wallet_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: FunnelStage,
    pub reached: u64,
    /// Conversion from the previous stage; `None` for `created`.
    pub conversion: Option<Ratio>,
    pub drop_off: Option<Ratio>,
    /// Over wallets with a known creation date only.
    pub avg_hours_to_achieve: Option<f64>,
    pub median_hours_to_achieve: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropOff {
    pub from: FunnelStage,
    pub to: FunnelStage,
    pub drop_off: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStats {
    pub population: u64,
    pub stages: Vec<StageStats>,
    /// Largest drop-off first; transitions with insufficient data are left out.
    pub drop_off_ranking: Vec<DropOff>,
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

pub fn funnel_stats(population: &[(FunnelState, Option<DateTime<Utc>>)]) -> FunnelStats {
    let mut stages = Vec::with_capacity(STAGE_COUNT);
    let mut prev_reached: Option<u64> = None;

    for stage in FunnelStage::ALL {
        let reached = population
            .iter()
            .filter(|(s, created)| {
                // A registered wallet exists, so it was created even if the time is unknown.
                s.reached(stage) || (stage == FunnelStage::Created && created.is_none())
            })
            .count() as u64;

        let mut hours: Vec<f64> = population
            .iter()
            .filter_map(|(s, created)| s.time_to_achieve_hours(stage, *created))
            .collect();
        hours.sort_by(f64::total_cmp);
        let avg = (!hours.is_empty()).then(|| hours.iter().sum::<f64>() / hours.len() as f64);

        let conversion = prev_reached.map(|p| Ratio::of(reached as f64, p as f64));
        stages.push(StageStats {
            stage,
            reached,
            conversion,
            drop_off: conversion.map(|c| c.map(|v| 1.0 - v)),
            avg_hours_to_achieve: avg,
            median_hours_to_achieve: median(&hours),
        });
        prev_reached = Some(reached);
    }

    let mut drop_off_ranking: Vec<DropOff> = stages
        .windows(2)
        .filter_map(|w| {
            let d = w[1].drop_off?.value()?;
            Some(DropOff {
                from: w[0].stage,
                to: w[1].stage,
                drop_off: d,
            })
        })
        .collect();
    drop_off_ranking.sort_by(|a, b| b.drop_off.total_cmp(&a.drop_off));

    FunnelStats {
        population: population.len() as u64,
        stages,
        drop_off_ranking,
    }
}

/// Funnel states for every registered wallet matching the filter.
pub fn load_population(
    conn: &Connection,
    filter: &SegmentFilter,
) -> Result<Vec<(FunnelState, Option<DateTime<Utc>>)>> {
    let wallets: Vec<(String, Option<DateTime<Utc>>)> = conn
        .prepare(
            "SELECT w.wallet_id, w.created_at FROM wallets w
             WHERE (?1 IS NULL OR w.wallet_type = ?1)
               AND (?2 IS NULL OR EXISTS (
                    SELECT 1 FROM cohort_assignments ca
                    WHERE ca.wallet_id = w.wallet_id AND ca.cohort_id = ?2))
             ORDER BY w.wallet_id ASC",
        )?
        .query_map(
            rusqlite::params![filter.wallet_type, filter.cohort_id],
            |row| Ok((row.get(0)?, col_ts_opt(row, 1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    wallets
        .into_iter()
        .map(|(wallet_id, created)| -> Result<_> { Ok((load_state(conn, &wallet_id)?, created)) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::{cfg as activity_cfg, event, ts, wallet};
    use crate::activity::{aggregate, AggregationMode};
    use common::types::TxType;

    fn cfg(min_days: u32) -> FunnelConfig {
        FunnelConfig {
            recurring_min_days: min_days,
            recurring_window_days: 30,
            high_value_volume_threshold: 1000.0,
        }
    }

    fn seed(conn: &mut Connection, w: &WalletInfo, events: &[common::types::TransactionEvent]) {
        aggregate(conn, w, events, AggregationMode::Incremental, &activity_cfg()).unwrap();
    }

    #[test]
    fn test_high_value_on_day_two_with_first_tx_gap() {
        let mut conn = common::db::open_memory().unwrap();
        let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
        let t = ts(2024, 1, 2, 15);
        seed(&mut conn, &w, &[event("w1", "big", t, TxType::Swap, 5000)]);

        let eval = evaluate(&mut conn, &w, ts(2024, 1, 3, 0), &cfg(1)).unwrap();
        let s = &eval.state;
        assert_eq!(s.achieved_at(FunnelStage::Created), Some(ts(2024, 1, 1, 0)));
        assert_eq!(s.achieved_at(FunnelStage::FirstTx), Some(t));
        assert_eq!(s.achieved_at(FunnelStage::HighValue), Some(t));
        assert_eq!(s.achieved_at(FunnelStage::FirstTx), s.achieved_at(FunnelStage::HighValue));
        assert!(s.is_ordered());
        assert_eq!(eval.advanced.len(), 5);
    }

    #[test]
    fn test_stage_cannot_be_skipped_and_is_clipped_forward() {
        let mut conn = common::db::open_memory().unwrap();
        let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
        seed(
            &mut conn,
            &w,
            &[
                event("w1", "a", ts(2024, 1, 2, 1), TxType::Transfer, 1),
                event("w1", "b", ts(2024, 1, 3, 1), TxType::Transfer, 1),
                event("w1", "c", ts(2024, 1, 4, 1), TxType::Transfer, 1),
            ],
        );
        let first = evaluate(&mut conn, &w, ts(2024, 1, 5, 0), &cfg(3)).unwrap();
        // Recurring holds but feature usage has not happened: stop there.
        assert_eq!(first.state.achieved_at(FunnelStage::FeatureUsage), None);
        assert_eq!(first.state.achieved_at(FunnelStage::Recurring), None);

        seed(&mut conn, &w, &[event("w1", "d", ts(2024, 1, 10, 9), TxType::Bridge, 1)]);
        let second = evaluate(&mut conn, &w, ts(2024, 1, 11, 0), &cfg(3)).unwrap();
        let feature = second.state.achieved_at(FunnelStage::FeatureUsage).unwrap();
        let recurring = second.state.achieved_at(FunnelStage::Recurring).unwrap();
        assert_eq!(feature, ts(2024, 1, 10, 9));
        assert_eq!(recurring, feature);
        let adv = second
            .advanced
            .iter()
            .find(|a| a.stage == FunnelStage::Recurring)
            .unwrap();
        assert!(adv.clipped());
        assert_eq!(adv.raw_at, ts(2024, 1, 4, 1));
    }

    #[test]
    fn test_later_as_of_never_rewinds() {
        let mut conn = common::db::open_memory().unwrap();
        let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
        seed(&mut conn, &w, &[event("w1", "a", ts(2024, 1, 5, 6), TxType::Transfer, 1)]);
        let before = evaluate(&mut conn, &w, ts(2024, 1, 6, 0), &cfg(3)).unwrap().state;

        // Late-arriving earlier activity does not move an already-set stage.
        seed(&mut conn, &w, &[event("w1", "z", ts(2024, 1, 2, 6), TxType::Transfer, 1)]);
        for day in [6, 20, 28] {
            let after = evaluate(&mut conn, &w, ts(2024, 2, day, 0), &cfg(3)).unwrap().state;
            for stage in FunnelStage::ALL {
                if let Some(at) = before.achieved_at(stage) {
                    assert_eq!(after.achieved_at(stage), Some(at));
                }
            }
            assert!(after.is_ordered());
        }
        assert_eq!(load_state(&conn, "w1").unwrap().achieved_at(FunnelStage::FirstTx), Some(ts(2024, 1, 5, 6)));
    }

    #[test]
    fn test_as_of_hides_future_activity() {
        let mut conn = common::db::open_memory().unwrap();
        let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
        seed(&mut conn, &w, &[event("w1", "a", ts(2024, 1, 5, 6), TxType::Transfer, 1)]);
        let eval = evaluate(&mut conn, &w, ts(2024, 1, 4, 0), &cfg(3)).unwrap();
        assert_eq!(eval.state.current_stage(), Some(FunnelStage::Created));
    }

    #[test]
    fn test_later_transaction_on_as_of_day_is_not_yet_held() {
        let mut conn = common::db::open_memory().unwrap();
        let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
        seed(&mut conn, &w, &[event("w1", "late", ts(2024, 1, 5, 18), TxType::Swap, 5000)]);

        let morning = evaluate(&mut conn, &w, ts(2024, 1, 5, 6), &cfg(1)).unwrap();
        assert_eq!(morning.state.achieved_at(FunnelStage::FirstTx), None);
        assert_eq!(morning.state.current_stage(), Some(FunnelStage::Created));

        let evening = evaluate(&mut conn, &w, ts(2024, 1, 5, 20), &cfg(1)).unwrap();
        assert_eq!(evening.state.achieved_at(FunnelStage::FirstTx), Some(ts(2024, 1, 5, 18)));
        assert_eq!(evening.state.achieved_at(FunnelStage::HighValue), Some(ts(2024, 1, 5, 18)));
    }

    #[test]
    fn test_registry_creation_after_first_tx_clips() {
        let created = ts(2024, 1, 3, 0);
        let mut evidence: Evidence = [None; STAGE_COUNT];
        evidence[0] = Some(created);
        evidence[1] = Some(ts(2024, 1, 2, 0));
        let (state, adv) = advance(&FunnelState::new("w"), &evidence);
        assert_eq!(state.achieved_at(FunnelStage::FirstTx), Some(created));
        assert!(adv[1].clipped());
    }

    #[test]
    fn test_unknown_creation_does_not_gate_later_stages() {
        let mut evidence: Evidence = [None; STAGE_COUNT];
        evidence[1] = Some(ts(2024, 1, 2, 0));
        evidence[2] = Some(ts(2024, 1, 2, 1));
        let (state, _) = advance(&FunnelState::new("w"), &evidence);
        assert_eq!(state.achieved_at(FunnelStage::Created), None);
        assert_eq!(state.achieved_at(FunnelStage::FeatureUsage), Some(ts(2024, 1, 2, 1)));
        assert_eq!(state.time_to_achieve_hours(FunnelStage::FirstTx, None), None);

        // Creation resolves later than the first transaction it must precede.
        evidence[0] = Some(ts(2024, 1, 5, 0));
        let (resolved, adv) = advance(&state, &evidence);
        assert_eq!(resolved.achieved_at(FunnelStage::Created), Some(ts(2024, 1, 2, 0)));
        assert_eq!(adv.len(), 1);
        assert!(resolved.is_ordered());
    }

    fn state_with(n: usize, created: DateTime<Utc>) -> FunnelState {
        let mut s = FunnelState::new("w");
        for i in 0..n {
            s.achieved[i] = Some(created + chrono::Duration::hours(i as i64 * 10));
        }
        s
    }

    #[test]
    fn test_stats_conversion_and_ranking() {
        let c = ts(2024, 1, 1, 0);
        let population = vec![
            (state_with(5, c), Some(c)),
            (state_with(3, c), Some(c)),
            (state_with(2, c), Some(c)),
            (state_with(2, c), Some(c)),
        ];
        let stats = funnel_stats(&population);
        assert_eq!(stats.population, 4);
        let reached: Vec<u64> = stats.stages.iter().map(|s| s.reached).collect();
        assert_eq!(reached, vec![4, 4, 2, 1, 1]);
        assert_eq!(stats.stages[0].conversion, None);
        assert_eq!(stats.stages[2].conversion, Some(Ratio::Value(0.5)));
        assert_eq!(stats.stages[3].drop_off, Some(Ratio::Value(0.5)));
        assert_eq!(stats.stages[1].avg_hours_to_achieve, Some(10.0));
        assert_eq!(stats.stages[2].median_hours_to_achieve, Some(20.0));
        let top = &stats.drop_off_ranking[0];
        assert_eq!((top.from, top.to), (FunnelStage::FirstTx, FunnelStage::FeatureUsage));
    }

    #[test]
    fn test_stats_zero_denominator_is_insufficient_and_unranked() {
        let c = ts(2024, 1, 1, 0);
        let population = vec![(state_with(1, c), Some(c))];
        let stats = funnel_stats(&population);
        assert_eq!(stats.stages[1].conversion, Some(Ratio::Value(0.0)));
        assert_eq!(stats.stages[2].conversion, Some(Ratio::INSUFFICIENT));
        assert_eq!(stats.drop_off_ranking.len(), 1);

        let empty = funnel_stats(&[]);
        assert!(empty.drop_off_ranking.is_empty());
        assert_eq!(empty.stages[1].drop_off, Some(Ratio::INSUFFICIENT));
    }

    #[test]
    fn test_segment_filter_restricts_population() {
        let conn = common::db::open_memory().unwrap();
        conn.execute_batch(
            "INSERT INTO wallets (wallet_id, created_at, wallet_type) VALUES
                ('a', '2024-01-01T00:00:00Z', 'standard'),
                ('b', NULL, 'shielded_only');",
        )
        .unwrap();
        let all = load_population(&conn, &SegmentFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        let filter = SegmentFilter {
            wallet_type: Some("shielded_only".to_string()),
            ..SegmentFilter::default()
        };
        let only = load_population(&conn, &filter).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].1, None);
        assert_eq!(funnel_stats(&only).stages[0].reached, 1);
    }
}
