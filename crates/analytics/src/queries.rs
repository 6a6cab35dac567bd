//! Read-only query contract for alerting, recommendation and dashboard consumers.
//!
//! The sync functions take a `&Connection`; [`AnalyticsQueries`] runs them on the
//! `AsyncDb` thread with per-query latency metrics.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use common::db::AsyncDb;
use common::error::AnalyticsError;
use common::types::CohortType;
use rusqlite::Connection;

use crate::activity::{load_metrics, ActivityMetric};
use crate::cohorts::{
    cohort_type_correlation, detect_trends, load_cohort, load_cohorts, load_retention,
    CohortRetention, RetentionTrend, TypeCorrelation,
};
use crate::funnel::{funnel_stats, load_population, FunnelStats, SegmentFilter};
use crate::scoring::{load_pending_tasks, load_score, PendingTask, ProductivityScore};

pub fn get_activity_metrics(
    conn: &Connection,
    wallet_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<ActivityMetric>> {
    if from > to {
        return Err(AnalyticsError::InvalidDateRange { from, to }.into());
    }
    load_metrics(conn, wallet_id, Some(from), Some(to))
}

/// Cached retention for cohorts starting in `[from, to]`. A cohort without members
/// carries no retention values; [`CohortRetention::retention`] reports it as
/// insufficient data.
pub fn get_cohort_retention(
    conn: &Connection,
    cohort_type: CohortType,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<CohortRetention>> {
    load_cohorts(conn, cohort_type, from, to)?
        .iter()
        .map(|c| load_retention(conn, c))
        .collect()
}

pub fn get_retention_trends(
    conn: &Connection,
    cohort_type: CohortType,
    max_offset: u32,
    threshold_pct: f64,
) -> Result<Vec<RetentionTrend>> {
    let cohorts = get_cohort_retention(conn, cohort_type, None, None)?;
    Ok(detect_trends(&cohorts, max_offset, threshold_pct))
}

/// `None` when the cohort does not exist.
pub fn get_type_correlation(
    conn: &Connection,
    cohort_id: i64,
    offset: u32,
    as_of: NaiveDate,
) -> Result<Option<Vec<TypeCorrelation>>> {
    let Some(cohort) = load_cohort(conn, cohort_id)? else {
        return Ok(None);
    };
    cohort_type_correlation(conn, &cohort, offset, as_of).map(Some)
}

pub fn get_funnel_stats(conn: &Connection, filter: &SegmentFilter) -> Result<FunnelStats> {
    Ok(funnel_stats(&load_population(conn, filter)?))
}

pub fn get_productivity_score(conn: &Connection, wallet_id: &str) -> Result<Option<ProductivityScore>> {
    load_score(conn, wallet_id)
}

pub fn get_pending_tasks(conn: &Connection, wallet_id: &str) -> Result<Vec<PendingTask>> {
    load_pending_tasks(conn, wallet_id)
}

/// Async facade over the query functions.
#[derive(Clone)]
pub struct AnalyticsQueries {
    db: AsyncDb,
}

impl AnalyticsQueries {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn activity_metrics(
        &self,
        wallet_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ActivityMetric>> {
        let wallet_id = wallet_id.to_string();
        self.db
            .call_named("queries.activity_metrics", move |conn| {
                get_activity_metrics(conn, &wallet_id, from, to)
            })
            .await
    }

    pub async fn cohort_retention(
        &self,
        cohort_type: CohortType,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<CohortRetention>> {
        self.db
            .call_named("queries.cohort_retention", move |conn| {
                get_cohort_retention(conn, cohort_type, from, to)
            })
            .await
    }

    pub async fn retention_trends(
        &self,
        cohort_type: CohortType,
        max_offset: u32,
        threshold_pct: f64,
    ) -> Result<Vec<RetentionTrend>> {
        self.db
            .call_named("queries.retention_trends", move |conn| {
                get_retention_trends(conn, cohort_type, max_offset, threshold_pct)
            })
            .await
    }

    pub async fn type_correlation(
        &self,
        cohort_id: i64,
        offset: u32,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<TypeCorrelation>>> {
        self.db
            .call_named("queries.type_correlation", move |conn| {
                get_type_correlation(conn, cohort_id, offset, as_of.date_naive())
            })
            .await
    }

    pub async fn funnel_stats(&self, filter: SegmentFilter) -> Result<FunnelStats> {
        self.db
            .call_named("queries.funnel_stats", move |conn| get_funnel_stats(conn, &filter))
            .await
    }

    pub async fn productivity_score(&self, wallet_id: &str) -> Result<Option<ProductivityScore>> {
        let wallet_id = wallet_id.to_string();
        self.db
            .call_named("queries.productivity_score", move |conn| {
                get_productivity_score(conn, &wallet_id)
            })
            .await
    }

    pub async fn pending_tasks(&self, wallet_id: &str) -> Result<Vec<PendingTask>> {
        let wallet_id = wallet_id.to_string();
        self.db
            .call_named("queries.pending_tasks", move |conn| {
                get_pending_tasks(conn, &wallet_id)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::{cfg, event, ts, wallet};
    use crate::activity::{aggregate, AggregationMode};
    use crate::cohorts::assign_cohort;
    use common::types::{Ratio, TxType};

    #[test]
    fn test_activity_metrics_rejects_inverted_range() {
        let conn = common::db::open_memory().unwrap();
        let from = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = get_activity_metrics(&conn, "w1", from, to).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalyticsError>(),
            Some(AnalyticsError::InvalidDateRange { .. })
        ));
    }

    #[test]
    fn test_empty_cohort_reports_insufficient_data() {
        let conn = common::db::open_memory().unwrap();
        conn.execute(
            "INSERT INTO cohorts (cohort_type, period_start) VALUES ('weekly', '2024-01-01')",
            [],
        )
        .unwrap();
        let out = get_cohort_retention(&conn, CohortType::Weekly, None, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].retention(1), Ratio::INSUFFICIENT);
    }

    #[test]
    fn test_unscored_wallet_has_no_score_or_tasks() {
        let conn = common::db::open_memory().unwrap();
        assert_eq!(get_productivity_score(&conn, "nobody").unwrap(), None);
        assert!(get_pending_tasks(&conn, "nobody").unwrap().is_empty());
        assert!(get_type_correlation(&conn, 42, 1, ts(2024, 1, 1, 0).date_naive())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_async_facade_reads_metrics() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            let w = wallet("w1", Some(ts(2024, 1, 1, 0)));
            aggregate(
                conn,
                &w,
                &[event("w1", "t1", ts(2024, 1, 2, 3), TxType::Swap, 7)],
                AggregationMode::Incremental,
                &cfg(),
            )?;
            assign_cohort(conn, "w1", ts(2024, 1, 1, 0), CohortType::Weekly)?;
            Ok(())
        })
        .await
        .unwrap();

        let q = AnalyticsQueries::new(db);
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let rows = q.activity_metrics("w1", from, to).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].swaps_count, 1);

        let cohorts = q.cohort_retention(CohortType::Weekly, None, None).await.unwrap();
        assert_eq!(cohorts.len(), 1);
        assert_eq!(cohorts[0].cohort.wallet_count, 1);
        let stats = q.funnel_stats(SegmentFilter::default()).await.unwrap();
        assert_eq!(stats.population, 0, "wallet was never registered");
    }
}
