use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use common::config::Config;
use common::db::{AsyncDb, Database};
use common::types::{CohortType, Ratio};
use rusqlite::Connection;
use std::sync::Arc;

use crate::activity::load_metrics;
use crate::cohorts::{load_cohorts, Cohort, TypeCorrelation};
use crate::funnel::{self, SegmentFilter};
use crate::jobs::{
    ingest_jsonl, register_wallet, run_backfill_once, run_cohort_retention_once,
    run_wallet_pipeline_once, SqliteFeed, SqliteRegistry, WalletLocks,
};
use crate::queries;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Batch,
    Retention,
    Backfill {
        wallet_id: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    Ingest {
        path: String,
    },
    Register {
        wallet_id: String,
        created_at: Option<DateTime<Utc>>,
        wallet_type: String,
    },
    Wallet {
        wallet_id: String,
    },
    Cohorts {
        cohort_type: CohortType,
    },
    Funnel {
        filter: SegmentFilter,
    },
}

impl Command {
    /// Commands that run a batch job and need the async database.
    pub fn is_job(&self) -> bool {
        matches!(self, Self::Batch | Self::Retention | Self::Backfill { .. })
    }
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    s.parse::<NaiveDate>()
        .map_err(|e| format!("invalid date {s:?} (expected YYYY-MM-DD): {e}"))
}

fn parse_created_at(s: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    if s == "-" {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| format!("invalid created_at {s:?} (expected RFC 3339 or '-'): {e}"))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "batch" => Ok(Command::Batch),
        "retention" => Ok(Command::Retention),
        "backfill" => {
            const USAGE: &str = "usage: wallet-analytics backfill <wallet_id> <from> <to>";
            let wallet_id = args.next().ok_or_else(|| USAGE.to_string())?;
            let from = parse_date(&args.next().ok_or_else(|| USAGE.to_string())?)?;
            let to = parse_date(&args.next().ok_or_else(|| USAGE.to_string())?)?;
            if from > to {
                return Err(format!("invalid date range: {from} > {to}"));
            }
            Ok(Command::Backfill { wallet_id, from, to })
        }
        "ingest" => {
            let path = args
                .next()
                .ok_or_else(|| "usage: wallet-analytics ingest <events.jsonl>".to_string())?;
            Ok(Command::Ingest { path })
        }
        "register" => {
            const USAGE: &str =
                "usage: wallet-analytics register <wallet_id> <created_at|-> [wallet_type]";
            let wallet_id = args.next().ok_or_else(|| USAGE.to_string())?;
            let created_at = parse_created_at(&args.next().ok_or_else(|| USAGE.to_string())?)?;
            let wallet_type = args.next().unwrap_or_else(|| "standard".to_string());
            Ok(Command::Register {
                wallet_id,
                created_at,
                wallet_type,
            })
        }
        "wallet" => {
            let wallet_id = args
                .next()
                .ok_or_else(|| "usage: wallet-analytics wallet <wallet_id>".to_string())?;
            Ok(Command::Wallet { wallet_id })
        }
        "cohorts" => {
            let cohort_type = match args.next() {
                Some(t) => CohortType::parse(&t).map_err(|e| e.to_string())?,
                None => CohortType::Weekly,
            };
            Ok(Command::Cohorts { cohort_type })
        }
        "funnel" => {
            let mut filter = SegmentFilter::default();
            while let Some(flag) = args.next() {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for {flag}"))?;
                match flag.as_str() {
                    "--cohort" => {
                        filter.cohort_id = Some(
                            value
                                .parse()
                                .map_err(|e| format!("invalid cohort id {value:?}: {e}"))?,
                        );
                    }
                    "--wallet-type" => filter.wallet_type = Some(value),
                    other => return Err(format!("unknown funnel flag: {other}")),
                }
            }
            Ok(Command::Funnel { filter })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub fn run_command(db: &mut Database, cfg: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run | Command::Batch | Command::Retention | Command::Backfill { .. } => Ok(()),
        Command::Ingest { path } => ingest_file(&mut db.conn, &path),
        Command::Register {
            wallet_id,
            created_at,
            wallet_type,
        } => {
            let w = register_wallet(&mut db.conn, &wallet_id, created_at, &wallet_type)?;
            println!(
                "registered {}  created_at={}  type={}",
                w.wallet_id,
                w.created_at.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339()),
                w.wallet_type
            );
            Ok(())
        }
        Command::Wallet { wallet_id } => show_wallet(&db.conn, &wallet_id),
        Command::Cohorts { cohort_type } => {
            show_cohorts(&db.conn, cfg, cohort_type, Utc::now().date_naive())
        }
        Command::Funnel { filter } => show_funnel(&db.conn, &filter),
    }
}

/// Run a batch job command against the async database and print its report.
pub async fn run_job_command(db: &AsyncDb, cfg: Arc<Config>, cmd: Command) -> Result<()> {
    let feed = SqliteFeed::new(db.clone());
    let registry = SqliteRegistry::new(db.clone());
    let locks = WalletLocks::new();
    let as_of = Utc::now();

    match cmd {
        Command::Batch => {
            let r = run_wallet_pipeline_once(db, &feed, &registry, &locks, cfg, as_of).await?;
            println!(
                "wallet_pipeline: processed={} failed={} conflicts={} events={} duplicates={}",
                r.processed, r.failed, r.conflicts, r.events_accepted, r.duplicates
            );
        }
        Command::Retention => {
            let r = run_cohort_retention_once(db, &cfg, as_of).await?;
            println!(
                "cohort_retention: cohorts={} preliminary={} significant_trends={}",
                r.cohorts, r.preliminary_values, r.significant_trends
            );
        }
        Command::Backfill { wallet_id, from, to } => {
            let r = run_backfill_once(db, &feed, &registry, &locks, cfg, &wallet_id, from, to, as_of)
                .await?;
            println!(
                "backfill {wallet_id} {from}..{to}: accepted={} out_of_range={} score={}",
                r.aggregate.accepted, r.aggregate.out_of_range, r.total_score
            );
        }
        other => anyhow::bail!("not a job command: {other:?}"),
    }
    Ok(())
}

fn ingest_file(conn: &mut Connection, path: &str) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("open {path}"))?;
    let (staged, rejected) = ingest_jsonl(conn, std::io::BufReader::new(file))?;
    println!("staged={staged} rejected={rejected}");
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletSummary {
    pub wallet_id: String,
    pub stage: Option<&'static str>,
    pub active_days: usize,
    pub total_score: Option<u8>,
    pub status: Option<&'static str>,
    pub risk: Option<&'static str>,
    pub pending_tasks: Vec<&'static str>,
}

pub fn query_wallet_summary(conn: &Connection, wallet_id: &str) -> Result<WalletSummary> {
    let state = funnel::load_state(conn, wallet_id)?;
    let metrics = load_metrics(conn, wallet_id, None, None)?;
    let score = queries::get_productivity_score(conn, wallet_id)?;
    Ok(WalletSummary {
        wallet_id: wallet_id.to_string(),
        stage: state.current_stage().map(|s| s.as_str()),
        active_days: metrics.iter().filter(|m| m.is_active).count(),
        total_score: score.as_ref().map(|s| s.total_score),
        status: score.as_ref().map(|s| s.status.as_str()),
        risk: score.as_ref().map(|s| s.risk_level.as_str()),
        pending_tasks: score
            .map(|s| s.pending_tasks.iter().map(|t| t.component.as_str()).collect())
            .unwrap_or_default(),
    })
}

fn show_wallet(conn: &Connection, wallet_id: &str) -> Result<()> {
    let s = query_wallet_summary(conn, wallet_id)?;
    println!("Wallet: {}", s.wallet_id);
    println!("  funnel_stage={}", s.stage.unwrap_or("none"));
    println!("  active_days={}", s.active_days);
    match s.total_score {
        Some(total) => println!(
            "  score={total}  status={}  risk={}",
            s.status.unwrap_or("-"),
            s.risk.unwrap_or("-")
        ),
        None => println!("  (not scored yet)"),
    }
    if !s.pending_tasks.is_empty() {
        println!("  pending_tasks={}", s.pending_tasks.join(","));
    }
    Ok(())
}

/// Type-mix correlation for every cohort of `cohort_type` at the configured offset.
pub fn query_type_correlations(
    conn: &Connection,
    cfg: &Config,
    cohort_type: CohortType,
    as_of: NaiveDate,
) -> Result<Vec<(Cohort, Vec<TypeCorrelation>)>> {
    let offset = cfg.cohorts.correlation_offset;
    let mut out = Vec::new();
    for cohort in load_cohorts(conn, cohort_type, None, None)? {
        if let Some(rows) = queries::get_type_correlation(conn, cohort.cohort_id, offset, as_of)? {
            out.push((cohort, rows));
        }
    }
    Ok(out)
}

fn show_cohorts(conn: &Connection, cfg: &Config, cohort_type: CohortType, as_of: NaiveDate) -> Result<()> {
    println!("Cohort retention ({}):", cohort_type.as_str());
    for c in queries::get_cohort_retention(conn, cohort_type, None, None)? {
        let points: Vec<String> = c
            .points
            .iter()
            .map(|p| {
                let mark = if p.preliminary { "*" } else { "" };
                format!("k{}={:.1}{mark}", p.offset, p.retention_pct)
            })
            .collect();
        println!(
            "{}  id={}  wallets={}  {}",
            c.cohort.period_start,
            c.cohort.cohort_id,
            c.cohort.wallet_count,
            points.join(" ")
        );
    }
    for t in queries::get_retention_trends(
        conn,
        cohort_type,
        cfg.cohorts.max_offset,
        cfg.cohorts.trend_threshold_pct,
    )? {
        if t.significant {
            println!(
                "  trend k{}: {:.1} -> {:.1} ({:+.1})  {} vs {}",
                t.offset, t.previous_pct, t.latest_pct, t.delta, t.latest_period, t.previous_period
            );
        }
    }

    println!("Type mix vs retention (k{}):", cfg.cohorts.correlation_offset);
    for (cohort, rows) in query_type_correlations(conn, cfg, cohort_type, as_of)? {
        let cells: Vec<String> = rows
            .iter()
            .filter(|r| r.wallets > 0)
            .map(|r| match r.delta_pct.value() {
                Some(d) => format!("{}:{d:+.1}pp(n={})", r.tx_type, r.wallets),
                None => format!("{}:{}", r.tx_type, r.delta_pct),
            })
            .collect();
        let baseline = rows.first().map_or(Ratio::INSUFFICIENT, |r| r.baseline_pct);
        println!("{}  baseline={baseline}  {}", cohort.period_start, cells.join(" "));
    }
    Ok(())
}

fn show_funnel(conn: &Connection, filter: &SegmentFilter) -> Result<()> {
    let stats = queries::get_funnel_stats(conn, filter)?;
    println!("Funnel (population={}):", stats.population);
    for s in &stats.stages {
        let conversion = s.conversion.map_or_else(|| "-".to_string(), |r| r.to_string());
        let median = s
            .median_hours_to_achieve
            .map_or_else(|| "-".to_string(), |h| format!("{h:.1}h"));
        println!(
            "{:<14} reached={:<6} conversion={conversion:<18} median={median}",
            s.stage.as_str(),
            s.reached
        );
    }
    if let Some(worst) = stats.drop_off_ranking.first() {
        println!(
            "largest drop-off: {} -> {} ({:.1}%)",
            worst.from.as_str(),
            worst.to.as_str(),
            worst.drop_off * 100.0
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::ts;

    fn args(v: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("wallet-analytics".to_string())
            .chain(v.iter().map(|s| (*s).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults_to_run() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
    }

    #[test]
    fn test_parse_backfill() {
        let cmd = parse_args(args(&["backfill", "w1", "2024-01-01", "2024-01-31"])).unwrap();
        assert_eq!(
            cmd,
            Command::Backfill {
                wallet_id: "w1".to_string(),
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            }
        );
        assert!(cmd.is_job());
        assert!(parse_args(args(&["backfill", "w1", "2024-02-01", "2024-01-01"])).is_err());
        assert!(parse_args(args(&["backfill", "w1", "yesterday", "2024-01-01"])).is_err());
    }

    #[test]
    fn test_parse_register_with_unknown_creation() {
        let cmd = parse_args(args(&["register", "w1", "-"])).unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                wallet_id: "w1".to_string(),
                created_at: None,
                wallet_type: "standard".to_string(),
            }
        );
        let cmd = parse_args(args(&["register", "w2", "2024-01-03T00:00:00Z", "shielded_only"])).unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                wallet_id: "w2".to_string(),
                created_at: Some(ts(2024, 1, 3, 0)),
                wallet_type: "shielded_only".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_funnel_filters() {
        let cmd = parse_args(args(&["funnel", "--cohort", "7", "--wallet-type", "standard"])).unwrap();
        assert_eq!(
            cmd,
            Command::Funnel {
                filter: SegmentFilter {
                    cohort_id: Some(7),
                    wallet_type: Some("standard".to_string()),
                }
            }
        );
        assert!(parse_args(args(&["funnel", "--cohort"])).is_err());
        assert!(parse_args(args(&["funnel", "--color", "red"])).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_cohort_type_and_command() {
        assert!(parse_args(args(&["cohorts", "daily"])).is_err());
        assert!(parse_args(args(&["rankings"])).is_err());
    }

    #[test]
    fn test_type_correlations_use_configured_offset() {
        use crate::activity::tests::{cfg as activity_cfg, event, wallet};
        use crate::activity::{aggregate, AggregationMode};
        use common::types::TxType;

        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        for (id, at) in [("w1", ts(2024, 1, 9, 1)), ("w2", ts(2024, 1, 16, 1))] {
            register_wallet(&mut db.conn, id, Some(ts(2024, 1, 2, 0)), "standard").unwrap();
            let w = wallet(id, Some(ts(2024, 1, 2, 0)));
            aggregate(&mut db.conn, &w, &[event(id, "t", at, TxType::Swap, 1)], AggregationMode::Incremental, &activity_cfg())
                .unwrap();
        }

        let mut cfg = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let week1 = query_type_correlations(&db.conn, &cfg, CohortType::Weekly, as_of).unwrap();
        assert_eq!(week1.len(), 1);
        let swap = week1[0].1.iter().find(|r| r.tx_type == TxType::Swap).unwrap();
        assert_eq!(swap.retention_pct, Ratio::Value(50.0));

        cfg.cohorts.correlation_offset = 2;
        let week2 = query_type_correlations(&db.conn, &cfg, CohortType::Weekly, as_of).unwrap();
        let swap = week2[0].1.iter().find(|r| r.tx_type == TxType::Swap).unwrap();
        assert_eq!(swap.retention_pct, Ratio::Value(50.0));
        assert_eq!(swap.wallets, 2);

        cfg.cohorts.correlation_offset = 3;
        let week3 = query_type_correlations(&db.conn, &cfg, CohortType::Weekly, as_of).unwrap();
        let swap = week3[0].1.iter().find(|r| r.tx_type == TxType::Swap).unwrap();
        assert_eq!(swap.retention_pct, Ratio::Value(0.0));

        cfg.cohorts.correlation_offset = 0;
        assert!(query_type_correlations(&db.conn, &cfg, CohortType::Weekly, as_of).is_err());
    }

    #[test]
    fn test_wallet_summary_before_and_after_scoring() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        register_wallet(&mut db.conn, "w1", Some(ts(2024, 1, 1, 0)), "standard").unwrap();

        let s = query_wallet_summary(&db.conn, "w1").unwrap();
        assert_eq!(s.total_score, None);
        assert_eq!(s.active_days, 0);

        let cfg = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        crate::scoring::recalculate(&mut db.conn, "w1", ts(2024, 1, 10, 0), &cfg.scoring).unwrap();
        let s = query_wallet_summary(&db.conn, "w1").unwrap();
        assert!(s.total_score.is_some());
        assert_eq!(s.status, Some("churn"));
        assert!(!s.pending_tasks.is_empty());
    }
}
