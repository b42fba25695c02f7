//! Recovery Coordinator (C8, §4.7). Runs once per process start, before any
//! new job confirmation is accepted.

use sqlx::PgPool;
use uuid::Uuid;

use shipctl_carrier::CarrierAdapter;
use shipctl_db::{AuditSeverity, CompleteRowArgs};
use shipctl_schemas::{InterruptedJobInfo, JobStatus, ReviewRowDetail, RowStatus};

#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub jobs_scanned: usize,
    pub rows_resolved_completed: u64,
    pub rows_resolved_failed: u64,
    pub rows_resolved_needs_review: u64,
    pub orphaned_write_backs_enqueued: u64,
}

/// Step 1-5: reconcile every `in_flight` row of every `running`/`paused`
/// job against the carrier.
async fn reconcile_in_flight_rows(pool: &PgPool, carrier: &dyn CarrierAdapter, report: &mut RecoveryReport) -> anyhow::Result<()> {
    let rows = shipctl_db::list_in_flight_rows_for_recoverable_jobs(pool).await?;

    for row in rows {
        match carrier.find_shipment_by_idempotency_key(&row.idempotency_key).await {
            Ok(Some(result)) => {
                let tracking = result.tracking_numbers.first().cloned().unwrap_or_default();
                shipctl_db::complete_row(
                    pool,
                    row.job_id,
                    row.row_number,
                    CompleteRowArgs {
                        tracking_number: &tracking,
                        label_reference: result.label_data.first().map(String::as_str),
                        cost_minor_units: result.total_charges_minor_units,
                        duties_taxes_minor_units: result.breakdown.duties_taxes_minor_units,
                        destination_country: &row.order_snapshot.destination.country_code,
                        charge_breakdown: result.breakdown,
                        carrier_shipment_id: &result.shipment_id,
                    },
                )
                .await?;
                shipctl_db::enqueue_write_back(pool, row.job_id, row.row_number, &tracking, chrono::Utc::now()).await?;
                report.rows_resolved_completed += 1;
                if let Err(e) = shipctl_db::append_audit_event(
                    pool,
                    row.job_id,
                    AuditSeverity::Info,
                    "recovery_row_completed",
                    &format!("row {} resolved completed during recovery", row.row_number),
                    serde_json::json!({"row_number": row.row_number, "tracking": tracking}),
                    Some(row.row_number),
                )
                .await
                {
                    tracing::warn!(job_id = %row.job_id, error = %e, "append_audit_event failed");
                }
            }
            Ok(None) => {
                shipctl_db::fail_row(
                    pool,
                    row.job_id,
                    row.row_number,
                    "E-3006",
                    "carrier has no record of this shipment after recovery lookup",
                )
                .await?;
                report.rows_resolved_failed += 1;
                if let Err(e) = shipctl_db::append_audit_event(
                    pool,
                    row.job_id,
                    AuditSeverity::Error,
                    "recovery_row_failed",
                    &format!("row {} resolved failed during recovery: no carrier record", row.row_number),
                    serde_json::json!({"row_number": row.row_number, "error_code": "E-3006"}),
                    Some(row.row_number),
                )
                .await
                {
                    tracing::warn!(job_id = %row.job_id, error = %e, "append_audit_event failed");
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %row.job_id, row = row.row_number, error = %err, "recovery lookup ambiguous, marking needs_review");
                shipctl_db::mark_row_needs_review(pool, row.job_id, row.row_number).await?;
                report.rows_resolved_needs_review += 1;
                if let Err(e) = shipctl_db::append_audit_event(
                    pool,
                    row.job_id,
                    AuditSeverity::Warning,
                    "recovery_row_needs_review",
                    &format!("row {} marked needs_review during recovery: {err}", row.row_number),
                    serde_json::json!({"row_number": row.row_number, "error": err.to_string()}),
                    Some(row.row_number),
                )
                .await
                {
                    tracing::warn!(job_id = %row.job_id, error = %e, "append_audit_event failed");
                }
            }
        }
    }
    Ok(())
}

/// Second, independent scan (§4.7 final paragraph): `completed` rows with
/// no corresponding write-back task, from the crash window between "mark
/// row completed" and "enqueue write-back task" in the engine.
async fn enqueue_orphaned_write_backs(pool: &PgPool, report: &mut RecoveryReport) -> anyhow::Result<()> {
    for status in [JobStatus::Running, JobStatus::Paused] {
        let jobs = shipctl_db::list_jobs_with_status(pool, status).await?;
        for job in jobs {
            let orphans = shipctl_db::find_completed_rows_missing_write_back(pool, job.id).await?;
            for row in orphans {
                let Some(tracking) = row.tracking_number.as_deref() else {
                    continue;
                };
                let shipped_at = row.processed_at.unwrap_or_else(chrono::Utc::now);
                shipctl_db::enqueue_write_back(pool, job.id, row.row_number, tracking, shipped_at).await?;
                report.orphaned_write_backs_enqueued += 1;
                if let Err(e) = shipctl_db::append_audit_event(
                    pool,
                    job.id,
                    AuditSeverity::Warning,
                    "recovery_write_back_enqueued",
                    &format!("row {} had a completed shipment with no write-back task, enqueued during recovery", row.row_number),
                    serde_json::json!({"row_number": row.row_number, "tracking": tracking}),
                    Some(row.row_number),
                )
                .await
                {
                    tracing::warn!(job_id = %job.id, error = %e, "append_audit_event failed");
                }
            }
        }
    }
    Ok(())
}

/// Runs the full C8 algorithm. Must complete (or be skipped because there
/// is nothing to recover) before the orchestrator accepts new confirmations.
pub async fn run_startup_recovery(pool: &PgPool, carrier: &dyn CarrierAdapter) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let running = shipctl_db::list_jobs_with_status(pool, JobStatus::Running).await?;
    let paused = shipctl_db::list_jobs_with_status(pool, JobStatus::Paused).await?;
    report.jobs_scanned = running.len() + paused.len();

    reconcile_in_flight_rows(pool, carrier, &mut report).await?;
    enqueue_orphaned_write_backs(pool, &mut report).await?;

    tracing::info!(
        jobs_scanned = report.jobs_scanned,
        resolved_completed = report.rows_resolved_completed,
        resolved_failed = report.rows_resolved_failed,
        resolved_needs_review = report.rows_resolved_needs_review,
        orphaned_write_backs = report.orphaned_write_backs_enqueued,
        "startup recovery complete"
    );

    Ok(report)
}

/// Builds the §4.2.8 prompt summary for a job left `running` at process
/// start. Returns `None` for any job not in that state.
pub async fn interrupted_job_info(pool: &PgPool, job_id: Uuid) -> anyhow::Result<Option<InterruptedJobInfo>> {
    let Some(job) = shipctl_db::get_job(pool, job_id).await? else {
        return Ok(None);
    };
    if job.status != JobStatus::Running {
        return Ok(None);
    }

    let all_rows = shipctl_db::get_rows(pool, job_id, None).await?;
    let completed_rows: Vec<_> = all_rows.iter().filter(|r| r.status == RowStatus::Completed).collect();
    let in_flight_count = all_rows.iter().filter(|r| r.status == RowStatus::InFlight).count() as i64;
    let needs_review_count = all_rows.iter().filter(|r| r.status == RowStatus::NeedsReview).count() as i64;

    let last_completed = completed_rows.iter().max_by_key(|r| r.row_number);

    Ok(Some(InterruptedJobInfo {
        job_id: job.id,
        job_name: job.name,
        completed_rows: completed_rows.len() as i64,
        total_rows: job.total_rows,
        remaining_rows: job.total_rows - (all_rows.iter().filter(|r| r.status != RowStatus::Pending).count() as i64),
        last_row_number: last_completed.map(|r| r.row_number),
        last_tracking_number: last_completed.and_then(|r| r.tracking_number.clone()),
        error_code: job.error_code,
        error_message: job.error_message,
        in_flight_count,
        needs_review_count,
    }))
}

/// §4.2.8 **restart**: count of rows that already carry a tracking number,
/// for the "this will create duplicate shipments" warning the caller must
/// surface before asking for explicit confirmation.
pub async fn rows_with_tracking_count(pool: &PgPool, job_id: Uuid) -> anyhow::Result<i64> {
    let rows = shipctl_db::get_rows(pool, job_id, None).await?;
    Ok(rows.iter().filter(|r| r.tracking_number.is_some()).count() as i64)
}

/// §4.2.8 **review**: the full list of `needs_review` and `in_flight` rows
/// for the operator to cross-reference against the carrier directly.
pub async fn review_rows(pool: &PgPool, job_id: Uuid) -> anyhow::Result<Vec<ReviewRowDetail>> {
    let all_rows = shipctl_db::get_rows(pool, job_id, None).await?;
    Ok(all_rows
        .into_iter()
        .filter(|r| matches!(r.status, RowStatus::NeedsReview | RowStatus::InFlight))
        .map(|r| ReviewRowDetail {
            row_number: r.row_number,
            status: r.status,
            error_message: r.error_message,
            carrier_tracking: r.tracking_number,
            carrier_shipment_id: r.carrier_shipment_id,
            idempotency_key: r.idempotency_key,
            recovery_attempt_count: r.recovery_attempt_count,
        })
        .collect())
}
