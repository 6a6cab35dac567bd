//! Wallet analytics: daily activity aggregation, cohort retention, adoption
//! funnels and productivity scoring over a stream of classified transactions.

pub mod activity;
pub mod cli;
pub mod cohorts;
pub mod funnel;
pub mod jobs;
pub mod metrics;
pub mod queries;
pub mod scheduler;
pub mod scoring;
