use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub activity: Activity,
    pub cohorts: Cohorts,
    pub funnel: Funnel,
    pub scoring: Scoring,
    pub batch: Batch,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Activity {
    pub complexity_points_per_subtype: u32,
    pub complexity_cap: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cohorts {
    /// Highest retention offset computed per cohort (retention_1..retention_max_offset).
    pub max_offset: u32,
    /// Absolute delta in percentage points that marks a retention trend as significant.
    pub trend_threshold_pct: f64,
    /// Offset used when correlating transaction-type mix with retention.
    pub correlation_offset: u32,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Funnel {
    pub recurring_min_days: u32,
    pub recurring_window_days: u32,
    /// Cumulative volume (in event value units) a wallet must exceed to reach `high_value`.
    pub high_value_volume_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scoring {
    pub window_days: u32,

    pub retention_weight: f64,
    pub adoption_weight: f64,
    pub activity_weight: f64,
    pub diversity_weight: f64,

    pub frequency_points: f64,
    pub recency_points: f64,
    pub volume_points: f64,
    pub diversity_bonus_points: f64,
    /// Fraction of window days active that earns full frequency points.
    pub frequency_full_ratio: f64,
    /// Days without activity after which recency points reach zero.
    pub recency_horizon_days: u32,
    /// Ascending volume thresholds; each tier reached earns an equal share of `volume_points`.
    pub volume_tiers: Vec<f64>,
    /// Transactions per day that earn a full activity score.
    pub activity_target_tx_per_day: f64,

    pub healthy_threshold: f64,
    pub at_risk_threshold: f64,
    /// Drop in total score (points) between recalculations that is treated as high risk.
    pub large_drop_points: f64,

    pub component_healthy_threshold: f64,
    pub task_lookback_days: u32,
    pub task_improvement_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Batch {
    pub concurrency: usize,
    pub refresh_interval_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub op_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("reading {DEFAULT_CONFIG_PATH}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

impl Scoring {
    pub fn total_weight(&self) -> f64 {
        self.retention_weight + self.adoption_weight + self.activity_weight + self.diversity_weight
    }
}
