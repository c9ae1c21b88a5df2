//! Periodic triggering of clustering runs.

use crate::embedding::EmbeddingProvider;
use crate::error::RunError;
use crate::models::RunStats;
use crate::orchestrator::Orchestrator;
use crate::report::write_run_report;
use crate::store::ArticleStore;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, instrument, warn};

/// One run, followed by its report when `report_dir` is set.
///
/// A report that cannot be written is logged; the run already happened.
///
/// # Errors
/// The run error from [`Orchestrator::run_once`].
pub async fn run_and_report<S, E>(
    orchestrator: &Orchestrator<S, E>,
    shutdown: &watch::Receiver<bool>,
    report_dir: Option<&str>,
) -> Result<RunStats, RunError>
where
    S: ArticleStore,
    E: EmbeddingProvider,
{
    let stats = orchestrator.run_once(shutdown).await?;
    if let Some(dir) = report_dir {
        if let Err(e) = write_run_report(&stats, dir).await {
            warn!(report_dir = %dir, error = %e, "Failed to write run report");
        }
    }
    Ok(stats)
}

/// Run every `period`, starting immediately, until `shutdown` turns true.
///
/// Returns the number of runs that completed without a run error.
#[instrument(level = "info", skip_all, fields(period_secs = period.as_secs()))]
pub async fn run_periodic<S, E>(
    orchestrator: &Orchestrator<S, E>,
    period: Duration,
    report_dir: Option<&str>,
    mut shutdown: watch::Receiver<bool>,
) -> usize
where
    S: ArticleStore,
    E: EmbeddingProvider,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut runs = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match run_and_report(orchestrator, &shutdown, report_dir).await {
            Ok(stats) => {
                runs += 1;
                info!(
                    run_id = %stats.run_id,
                    outcome = ?stats.outcome,
                    next_in_secs = period.as_secs(),
                    "Scheduled run done"
                );
            }
            Err(e) => error!(error = %e, "Scheduled run failed; retrying next tick"),
        }
    }

    info!(runs, "Scheduler stopped");
    runs
}
