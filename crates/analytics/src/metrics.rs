use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "analytics_events_aggregated_total",
        "Transaction events folded into daily activity metrics."
    );
    describe_counter!(
        "analytics_duplicate_events_total",
        "Redelivered events ignored by the dedup ledger."
    );
    describe_counter!(
        "analytics_malformed_events_total",
        "Feed payloads that could not be decoded."
    );
    describe_counter!(
        "analytics_missing_creation_date_total",
        "Aggregation runs for wallets with an unknown creation date."
    );
    describe_gauge!(
        "analytics_cohort_retention_pct",
        "Latest retention percentage per cohort type and offset."
    );
    describe_counter!(
        "analytics_retention_trend_alerts_total",
        "Significant period-over-period retention changes."
    );
    describe_counter!(
        "analytics_funnel_stage_reached_total",
        "Funnel stages newly achieved, by stage."
    );
    describe_counter!(
        "analytics_funnel_stage_anomalies_total",
        "Stage timestamps clipped to keep the funnel ordered."
    );
    describe_histogram!(
        "analytics_total_score",
        "Distribution of recalculated productivity scores."
    );
    describe_counter!(
        "analytics_score_clamped_total",
        "Component scores clamped into range or replaced for NaN."
    );
    describe_counter!(
        "analytics_tasks_completed_total",
        "Improvement tasks completed."
    );
    describe_counter!(
        "analytics_recalculation_conflicts_total",
        "Wallet pipelines retried after a concurrent score write."
    );
    describe_counter!(
        "analytics_wallets_processed_total",
        "Wallets taken through the full pipeline."
    );
    describe_histogram!(
        "analytics_job_duration_ms",
        "Batch job duration in milliseconds."
    );
    describe_counter!(
        "analytics_source_requests_total",
        "Calls to the transaction feed and wallet registry."
    );
    describe_histogram!(
        "analytics_source_latency_ms",
        "Feed and registry call latency in milliseconds."
    );
    describe_histogram!(
        "analytics_db_query_latency_ms",
        "SQLite operation latency in milliseconds, including queueing."
    );
    describe_counter!(
        "analytics_db_query_errors_total",
        "Failed SQLite operations."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("analytics_events_aggregated_total").increment(3);
            metrics::counter!("analytics_funnel_stage_reached_total", "stage" => "first_tx")
                .increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("analytics_events_aggregated_total 3"));
        assert!(rendered.contains(r#"analytics_funnel_stage_reached_total{stage="first_tx"} 1"#));
    }
}
