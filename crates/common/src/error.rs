//! Typed error conditions the engine matches on.
//!
//! Everything else flows through `anyhow`; these variants exist so callers can
//! `downcast_ref` and decide between retrying and failing the batch.

use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// Another recalculation wrote this wallet's score since we read it.
    #[error("concurrent recalculation conflict for wallet {wallet_id}")]
    RecalculationConflict { wallet_id: String },

    #[error("{op}: retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { op: &'static str, attempts: u32 },

    #[error("{op}: timed out")]
    Timeout { op: &'static str },

    #[error("invalid cohort type: {0}")]
    InvalidCohortType(String),

    #[error("invalid date range: {from} > {to}")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },

    /// Retention offsets count periods after the cohort's own, starting at 1.
    #[error("invalid retention offset {offset}")]
    InvalidOffset { offset: u32 },
}

impl AnalyticsError {
    pub fn is_conflict(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<Self>(),
            Some(Self::RecalculationConflict { .. })
        )
    }
}
