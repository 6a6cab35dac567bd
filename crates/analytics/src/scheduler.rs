use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    /// Fire once at startup instead of waiting a full interval.
    pub run_immediately: bool,
    pub tick: mpsc::Sender<()>,
}

/// One ticker task per job. A tick that lands while the job is still running is
/// skipped rather than queued.
pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            tokio::spawn(async move {
                let start_at = if job.run_immediately {
                    Instant::now()
                } else {
                    Instant::now() + job.interval
                };
                let mut interval = tokio::time::interval_at(start_at, job.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    interval.tick().await;
                    tracing::debug!(job = %job.name, "scheduler tick");
                    match job.tick.try_send(()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(())) => {
                            tracing::debug!(job = %job.name, "previous run still pending; tick dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(())) => break,
                    }
                }
            })
        })
        .collect()
}
