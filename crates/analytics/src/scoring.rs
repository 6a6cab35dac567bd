//! Productivity scoring.
//!
//! [`score`] is a pure function of the wallet's activity window, funnel state,
//! cohort retention context and the previous score (which carries task
//! state). [`recalculate`] loads those inputs, scores, and writes back with a
//! compare-and-swap on `calculated_at`.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::config::Scoring as ScoringConfig;
use common::error::AnalyticsError;
use common::types::{FunnelStage, RiskLevel, ScoreComponent, TxType, WalletStatus};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::activity::{col_ts_opt, load_metrics, ts_from_sql, ts_to_sql, ActivityMetric};
use crate::cohorts::wallet_retention_context;
use crate::funnel::{load_state, FunnelState};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInput {
    /// Metrics in the trailing window ending at `as_of` (inclusive).
    pub window: Vec<ActivityMetric>,
    /// Most recent active date at or before `as_of`, possibly outside the window.
    pub last_active: Option<NaiveDate>,
    pub funnel: FunnelState,
    pub cohort_retention_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub retention: f64,
    pub adoption: f64,
    pub activity: f64,
    pub diversity: f64,
}

impl ComponentScores {
    pub fn get(&self, c: ScoreComponent) -> f64 {
        match c {
            ScoreComponent::Retention => self.retention,
            ScoreComponent::Adoption => self.adoption,
            ScoreComponent::Activity => self.activity,
            ScoreComponent::Diversity => self.diversity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub component: ScoreComponent,
    pub created_at: DateTime<Utc>,
    /// Component value the improvement is measured against.
    pub baseline: f64,
    pub baseline_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub component: ScoreComponent,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub baseline: f64,
    pub final_value: f64,
    /// Relative improvement over baseline at completion.
    pub effectiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductivityScore {
    pub wallet_id: String,
    pub total_score: u8,
    pub previous_total_score: Option<u8>,
    pub components: ComponentScores,
    pub status: WalletStatus,
    pub risk_level: RiskLevel,
    pub cohort_retention_pct: Option<f64>,
    pub pending_tasks: Vec<PendingTask>,
    pub completed_tasks: Vec<CompletedTask>,
    pub calculated_at: DateTime<Utc>,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn distinct_tracked_types(window: &[ActivityMetric]) -> usize {
    TxType::TRACKED
        .into_iter()
        .filter(|t| window.iter().any(|m| m.type_count(*t) > 0))
        .count()
}

fn window_volume(window: &[ActivityMetric]) -> f64 {
    window
        .iter()
        .map(|m| m.total_volume)
        .sum::<Decimal>()
        .to_f64()
        .unwrap_or(0.0)
}

/// Frequency + recency + volume tier + type-diversity bonus, in points.
pub fn retention_points(input: &ScoreInput, cfg: &ScoringConfig, as_of: NaiveDate) -> f64 {
    let window_days = f64::from(cfg.window_days.max(1));
    let active_days = input.window.iter().filter(|m| m.is_active).count() as f64;
    let frequency = if cfg.frequency_full_ratio > 0.0 {
        clamp01(active_days / window_days / cfg.frequency_full_ratio)
    } else {
        0.0
    };

    // Linear decay to zero at the horizon; no activity ever earns nothing.
    let recency = input.last_active.map_or(0.0, |last| {
        let idle = (as_of - last).num_days().max(0) as f64;
        let horizon = f64::from(cfg.recency_horizon_days.max(1));
        clamp01(1.0 - idle / horizon)
    });

    let volume = window_volume(&input.window);
    let tiers_reached = cfg.volume_tiers.iter().filter(|t| volume >= **t).count();
    let volume_share = if cfg.volume_tiers.is_empty() {
        0.0
    } else {
        tiers_reached as f64 / cfg.volume_tiers.len() as f64
    };

    let diversity = distinct_tracked_types(&input.window) as f64 / TxType::TRACKED.len() as f64;

    frequency * cfg.frequency_points
        + recency * cfg.recency_points
        + volume_share * cfg.volume_points
        + diversity * cfg.diversity_bonus_points
}

/// Later stages weigh more: stage i (1-based) contributes i / 15 of 100.
pub fn adoption_points(funnel: &FunnelState) -> f64 {
    let total: usize = (1..=FunnelStage::ALL.len()).sum();
    let earned: usize = FunnelStage::ALL
        .into_iter()
        .filter(|s| funnel.achieved_at(*s).is_some())
        .map(|s| s.index() + 1)
        .sum();
    earned as f64 / total as f64 * 100.0
}

/// Transactions per window day relative to the target rate.
pub fn activity_points(window: &[ActivityMetric], cfg: &ScoringConfig) -> f64 {
    let tx: u64 = window.iter().map(|m| u64::from(m.transaction_count)).sum();
    let per_day = tx as f64 / f64::from(cfg.window_days.max(1));
    if cfg.activity_target_tx_per_day <= 0.0 {
        return 0.0;
    }
    (per_day / cfg.activity_target_tx_per_day).min(1.0) * 100.0
}

pub fn diversity_points(window: &[ActivityMetric]) -> f64 {
    distinct_tracked_types(window) as f64 / TxType::TRACKED.len() as f64 * 100.0
}

fn clamp_component(wallet_id: &str, component: ScoreComponent, raw: f64) -> f64 {
    if raw.is_nan() {
        metrics::counter!("analytics_score_clamped_total", "component" => component.as_str())
            .increment(1);
        tracing::warn!(wallet_id, component = component.as_str(), "component score is NaN; using 0");
        return 0.0;
    }
    if !(0.0..=100.0).contains(&raw) {
        metrics::counter!("analytics_score_clamped_total", "component" => component.as_str())
            .increment(1);
        tracing::warn!(wallet_id, component = component.as_str(), raw, "component score out of range; clamped");
    }
    raw.clamp(0.0, 100.0)
}

pub fn compute_components(
    wallet_id: &str,
    input: &ScoreInput,
    cfg: &ScoringConfig,
    as_of: NaiveDate,
) -> ComponentScores {
    ComponentScores {
        retention: clamp_component(wallet_id, ScoreComponent::Retention, retention_points(input, cfg, as_of)),
        adoption: clamp_component(wallet_id, ScoreComponent::Adoption, adoption_points(&input.funnel)),
        activity: clamp_component(wallet_id, ScoreComponent::Activity, activity_points(&input.window, cfg)),
        diversity: clamp_component(wallet_id, ScoreComponent::Diversity, diversity_points(&input.window)),
    }
}

/// Weighted total, normalized by the weight sum, rounded into [0, 100].
pub fn total_score(c: &ComponentScores, cfg: &ScoringConfig) -> u8 {
    let total_w = cfg.total_weight();
    if total_w.is_nan() || total_w <= 0.0 {
        return 0;
    }
    let raw = (cfg.retention_weight * c.retention
        + cfg.adoption_weight * c.adoption
        + cfg.activity_weight * c.activity
        + cfg.diversity_weight * c.diversity)
        / total_w;
    if raw.is_nan() {
        return 0;
    }
    // Clamped to [0, 100] so the cast cannot truncate.
    raw.round().clamp(0.0, 100.0) as u8
}

pub fn classify_status(total: u8, cfg: &ScoringConfig) -> WalletStatus {
    let t = f64::from(total);
    if t >= cfg.healthy_threshold {
        WalletStatus::Healthy
    } else if t >= cfg.at_risk_threshold {
        WalletStatus::AtRisk
    } else {
        WalletStatus::Churn
    }
}

pub fn classify_risk(status: WalletStatus, delta: Option<i16>, cfg: &ScoringConfig) -> RiskLevel {
    let delta = f64::from(delta.unwrap_or(0));
    if status == WalletStatus::Churn || delta <= -cfg.large_drop_points {
        RiskLevel::High
    } else if delta < 0.0 || status == WalletStatus::AtRisk {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// A zero baseline is measured against one point so any gain counts.
fn relative_improvement(baseline: f64, current: f64) -> f64 {
    let denominator = if baseline == 0.0 { 1.0 } else { baseline };
    (current - baseline) / denominator
}

/// Advance the task lifecycle: complete, re-baseline, then emit.
///
/// A component that has had a task resolved is re-armed only once it is back at
/// or above its healthy threshold; the next task is emitted on the following
/// downward crossing, detected against `previous_components`.
pub fn update_tasks(
    previous_pending: &[PendingTask],
    previous_completed: &[CompletedTask],
    previous_components: Option<&ComponentScores>,
    components: &ComponentScores,
    cfg: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> (Vec<PendingTask>, Vec<CompletedTask>) {
    let lookback = Duration::days(i64::from(cfg.task_lookback_days));
    let mut completed = previous_completed.to_vec();
    let mut pending = Vec::with_capacity(previous_pending.len());
    let mut resolved_now: BTreeSet<ScoreComponent> = BTreeSet::new();

    for task in previous_pending {
        let current = components.get(task.component);
        let improvement = relative_improvement(task.baseline, current);
        if improvement >= cfg.task_improvement_threshold {
            completed.push(CompletedTask {
                component: task.component,
                created_at: task.created_at,
                completed_at: as_of,
                baseline: task.baseline,
                final_value: current,
                effectiveness: improvement,
            });
            resolved_now.insert(task.component);
        } else if as_of - task.baseline_at >= lookback {
            // Lookback elapsed without improvement: measure from here on.
            pending.push(PendingTask {
                baseline: current,
                baseline_at: as_of,
                ..task.clone()
            });
        } else {
            pending.push(task.clone());
        }
    }

    let threshold = cfg.component_healthy_threshold;
    for component in ScoreComponent::ALL {
        let value = components.get(component);
        let outstanding = pending.iter().any(|t| t.component == component);
        let ever_resolved = completed.iter().any(|t| t.component == component);
        let crossed = previous_components.is_none_or(|p| p.get(component) >= threshold);
        let armed = !ever_resolved || crossed;
        if value < threshold && !outstanding && !resolved_now.contains(&component) && armed {
            pending.push(PendingTask {
                component,
                created_at: as_of,
                baseline: value,
                baseline_at: as_of,
            });
        }
    }

    (pending, completed)
}

/// Score one wallet. Deterministic in all arguments.
pub fn score(
    wallet_id: &str,
    input: &ScoreInput,
    previous: Option<&ProductivityScore>,
    cfg: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> ProductivityScore {
    let components = compute_components(wallet_id, input, cfg, as_of.date_naive());
    let total = total_score(&components, cfg);
    let status = classify_status(total, cfg);
    let previous_total = previous.map(|p| p.total_score);
    let delta = previous_total.map(|p| i16::from(total) - i16::from(p));
    let risk_level = classify_risk(status, delta, cfg);

    let (pending_tasks, completed_tasks) = match previous {
        Some(p) => update_tasks(
            &p.pending_tasks,
            &p.completed_tasks,
            Some(&p.components),
            &components,
            cfg,
            as_of,
        ),
        None => update_tasks(&[], &[], None, &components, cfg, as_of),
    };

    ProductivityScore {
        wallet_id: wallet_id.to_string(),
        total_score: total,
        previous_total_score: previous_total,
        components,
        status,
        risk_level,
        cohort_retention_pct: input.cohort_retention_pct,
        pending_tasks,
        completed_tasks,
        calculated_at: as_of,
    }
}

pub fn load_score_input(
    conn: &Connection,
    wallet_id: &str,
    as_of: DateTime<Utc>,
    cfg: &ScoringConfig,
) -> Result<ScoreInput> {
    let end = as_of.date_naive();
    let start = end - Duration::days(i64::from(cfg.window_days.max(1)) - 1);
    let window = load_metrics(conn, wallet_id, Some(start), Some(end))?;
    let last_active: Option<String> = conn.query_row(
        "SELECT MAX(activity_date) FROM activity_metrics
         WHERE wallet_id = ?1 AND is_active = 1 AND activity_date <= ?2",
        rusqlite::params![wallet_id, end.to_string()],
        |row| row.get(0),
    )?;
    Ok(ScoreInput {
        window,
        last_active: last_active.and_then(|s| s.parse().ok()),
        funnel: load_state(conn, wallet_id)?,
        cohort_retention_pct: wallet_retention_context(conn, wallet_id)?,
    })
}

pub fn load_score(conn: &Connection, wallet_id: &str) -> Result<Option<ProductivityScore>> {
    let row = conn
        .query_row(
            "SELECT total_score, previous_total_score, retention_score, adoption_score,
                    activity_score, diversity_score, status, risk_level, cohort_retention_pct,
                    pending_tasks_json, completed_tasks_json, calculated_at
             FROM productivity_scores WHERE wallet_id = ?1",
            [wallet_id],
            |row| {
                Ok((
                    row.get::<_, u8>(0)?,
                    row.get::<_, Option<u8>>(1)?,
                    ComponentScores {
                        retention: row.get(2)?,
                        adoption: row.get(3)?,
                        activity: row.get(4)?,
                        diversity: row.get(5)?,
                    },
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<f64>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    col_ts_opt(row, 11)?,
                ))
            },
        )
        .optional()?;

    let Some((total, prev, components, status, risk, retention, pending, completed, at)) = row
    else {
        return Ok(None);
    };
    let calculated_at = at.ok_or_else(|| anyhow::anyhow!("score for {wallet_id} has no calculated_at"))?;
    Ok(Some(ProductivityScore {
        wallet_id: wallet_id.to_string(),
        total_score: total,
        previous_total_score: prev,
        components,
        status: WalletStatus::from_str_loose(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown status {status:?}"))?,
        risk_level: RiskLevel::from_str_loose(&risk)
            .ok_or_else(|| anyhow::anyhow!("unknown risk level {risk:?}"))?,
        cohort_retention_pct: retention,
        pending_tasks: serde_json::from_str(&pending)?,
        completed_tasks: serde_json::from_str(&completed)?,
        calculated_at,
    }))
}

/// Write `score` only if the stored row still carries `expected` as its
/// `calculated_at` (or is still absent when `expected` is `None`).
pub fn store_score(
    conn: &Connection,
    score: &ProductivityScore,
    expected: Option<DateTime<Utc>>,
) -> Result<()> {
    let pending = serde_json::to_string(&score.pending_tasks)?;
    let completed = serde_json::to_string(&score.completed_tasks)?;
    let c = &score.components;
    let status = score.status.as_str();
    let risk = score.risk_level.as_str();
    let calculated_at = ts_to_sql(score.calculated_at);
    let expected_at = expected.map(ts_to_sql);
    let params = rusqlite::params![
        score.wallet_id,
        score.total_score,
        score.previous_total_score,
        c.retention,
        c.adoption,
        c.activity,
        c.diversity,
        status,
        risk,
        score.cohort_retention_pct,
        pending,
        completed,
        calculated_at,
        expected_at,
    ];

    let changed = match expected {
        None => conn.execute(
            "INSERT INTO productivity_scores (
                wallet_id, total_score, previous_total_score, retention_score, adoption_score,
                activity_score, diversity_score, status, risk_level, cohort_retention_pct,
                pending_tasks_json, completed_tasks_json, calculated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
             WHERE ?14 IS NULL
             ON CONFLICT(wallet_id) DO NOTHING",
            params,
        )?,
        Some(_) => conn.execute(
            "UPDATE productivity_scores SET
                total_score = ?2, previous_total_score = ?3, retention_score = ?4,
                adoption_score = ?5, activity_score = ?6, diversity_score = ?7,
                status = ?8, risk_level = ?9, cohort_retention_pct = ?10,
                pending_tasks_json = ?11, completed_tasks_json = ?12, calculated_at = ?13
             WHERE wallet_id = ?1 AND calculated_at = ?14",
            params,
        )?,
    };

    if changed == 0 {
        return Err(AnalyticsError::RecalculationConflict {
            wallet_id: score.wallet_id.clone(),
        }
        .into());
    }
    Ok(())
}

/// Load inputs, score and store in one transaction.
pub fn recalculate(
    conn: &mut Connection,
    wallet_id: &str,
    as_of: DateTime<Utc>,
    cfg: &ScoringConfig,
) -> Result<ProductivityScore> {
    let tx = conn.transaction()?;
    let previous = load_score(&tx, wallet_id)?;
    let input = load_score_input(&tx, wallet_id, as_of, cfg)?;
    let next = score(wallet_id, &input, previous.as_ref(), cfg, as_of);
    store_score(&tx, &next, previous.as_ref().map(|p| p.calculated_at))?;
    tx.commit()?;

    let new_completions = next.completed_tasks.len()
        - previous.as_ref().map_or(0, |p| p.completed_tasks.len());
    if new_completions > 0 {
        metrics::counter!("analytics_tasks_completed_total").increment(new_completions as u64);
    }
    metrics::histogram!("analytics_total_score").record(f64::from(next.total_score));
    tracing::debug!(
        wallet_id,
        total_score = next.total_score,
        status = next.status.as_str(),
        risk = next.risk_level.as_str(),
        "productivity score recalculated"
    );
    Ok(next)
}

/// Outstanding tasks for a wallet; empty when it has never been scored.
pub fn load_pending_tasks(conn: &Connection, wallet_id: &str) -> Result<Vec<PendingTask>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT pending_tasks_json FROM productivity_scores WHERE wallet_id = ?1",
            [wallet_id],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(j) => Ok(serde_json::from_str(&j)?),
        None => Ok(Vec::new()),
    }
}

/// `calculated_at` of the stored score, for callers that only need the CAS token.
pub fn score_version(conn: &Connection, wallet_id: &str) -> Result<Option<DateTime<Utc>>> {
    let s: Option<String> = conn
        .query_row(
            "SELECT calculated_at FROM productivity_scores WHERE wallet_id = ?1",
            [wallet_id],
            |row| row.get(0),
        )
        .optional()?;
    s.as_deref().map(ts_from_sql).transpose()
}
