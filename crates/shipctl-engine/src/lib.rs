//! Batch Engine (C5, §4.2) — THE CORE. Drives row-by-row execution against
//! the carrier with idempotency, durable per-row state, fail-fast halt on
//! the first error, non-blocking progress emission, and asynchronous
//! write-back enqueue.

pub mod idempotency;
pub mod state_machine;

use std::sync::{Arc, Mutex as StdMutex};

use sqlx::PgPool;
use uuid::Uuid;

pub use idempotency::idempotency_key;

use shipctl_audit::DecisionWriter;
use shipctl_carrier::{CarrierAdapter, CarrierError, ShipmentRequest};
use shipctl_db::{AuditSeverity, CompleteRowArgs};
use shipctl_schemas::ProgressEvent;

/// Local, pre-carrier-call structural validation (§4.2.1 step 3: "the
/// mapping is total; missing structural fields fail the row fast, before
/// the carrier call"). Produces the stable E-1xxx/E-2xxx taxonomy (§7)
/// rather than letting a malformed request reach C2 at all.
fn validate_request(request: &ShipmentRequest) -> Result<(), CarrierError> {
    let d = &request.destination;
    if d.name.trim().is_empty() {
        return Err(CarrierError::missing_field("destination.name"));
    }
    if d.address_line1.trim().is_empty() {
        return Err(CarrierError::missing_field("destination.address_line1"));
    }
    if d.city.trim().is_empty() {
        return Err(CarrierError::missing_field("destination.city"));
    }
    if d.postal_code.trim().is_empty() {
        return Err(CarrierError::missing_field("destination.postal_code"));
    }
    if d.country_code.trim().is_empty() {
        return Err(CarrierError::missing_field("destination.country_code"));
    }
    if request.service_code.trim().is_empty() {
        return Err(CarrierError::missing_field("service_code"));
    }
    if request.weight_oz <= 0 {
        return Err(CarrierError::structural_fields_required("weight_oz must be positive"));
    }
    if request.length_in <= 0 || request.width_in <= 0 || request.height_in <= 0 {
        return Err(CarrierError::structural_fields_required(
            "length_in, width_in, and height_in must all be positive",
        ));
    }
    if request.declared_value_minor_units < 0 {
        return Err(CarrierError::structural_fields_required(
            "declared_value_minor_units must not be negative",
        ));
    }

    let shipper_country = request
        .shipper_snapshot_json
        .get("country_code")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !shipper_country.is_empty() && !d.country_code.eq_ignore_ascii_case(shipper_country) && request.hs_code.is_none() {
        return Err(CarrierError::international_missing_field("hs_code"));
    }

    Ok(())
}

/// Records one lifecycle event to the DB audit trail (spec step 6's "report
/// ... to the audit ledger", queried back by `/jobs/:id/logs|errors|export`)
/// and, when a decision ledger is open for this run, to the hash-chained
/// JSONL ledger alongside it. Never fails the row/batch on its own account —
/// an audit write failing is logged and swallowed, not propagated.
async fn audit(
    pool: &PgPool,
    decisions: Option<&StdMutex<DecisionWriter>>,
    job_id: Uuid,
    severity: AuditSeverity,
    event_type: &str,
    message: &str,
    detail: serde_json::Value,
    row_number: Option<i64>,
) {
    if let Err(e) =
        shipctl_db::append_audit_event(pool, job_id, severity, event_type, message, detail.clone(), row_number).await
    {
        tracing::warn!(job_id = %job_id, error = %e, "append_audit_event failed");
    }
    if let Some(writer) = decisions {
        let append_result = writer.lock().expect("decision ledger mutex poisoned").append(job_id, event_type, detail);
        if let Err(e) = append_result {
            tracing::warn!(job_id = %job_id, error = %e, "decision ledger append failed");
        }
    }
}

/// Signals the engine checks between rows (§4.2.1, §4.2.3: cancellation is
/// cooperative, checked between rows, never mid-carrier-call).
pub trait CancellationSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Invoked synchronously at each lifecycle point (§4.2.4). MUST NOT block —
/// slow consumers are the Progress Hub's problem, not the engine's.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Notified after each successfully completed row so the write-back worker
/// can drain immediately instead of waiting for its timer (§4.5).
pub trait WriteBackSignal: Send + Sync {
    fn notify(&self);
}

pub struct EngineOutcome {
    pub total: i64,
    pub successful: i64,
    pub processed: i64,
    pub halted_by_error: Option<(String, String)>,
}

/// Executes every `pending` row of `job_id` in ascending row-number order,
/// halting on the first non-success (§4.2.1, §4.2.2). Rows not in `pending`
/// (already completed/failed/skipped from a prior run) are left untouched —
/// this is what makes resuming after a crash or a partial run safe.
pub async fn run_job(
    pool: &PgPool,
    carrier: &dyn CarrierAdapter,
    job_id: Uuid,
    shipper_snapshot_json: serde_json::Value,
    restart_epoch: i64,
    write_back_enabled: bool,
    progress: &dyn ProgressSink,
    write_back_signal: &dyn WriteBackSignal,
    cancellation: &dyn CancellationSignal,
    decisions: Option<&StdMutex<DecisionWriter>>,
) -> anyhow::Result<EngineOutcome> {
    let pending_rows = shipctl_db::get_rows(pool, job_id, Some(shipctl_schemas::RowStatus::Pending)).await?;
    let all_rows = shipctl_db::get_rows(pool, job_id, None).await?;
    let total = all_rows.len() as i64;

    progress.emit(ProgressEvent::BatchStarted { total });
    audit(
        pool,
        decisions,
        job_id,
        AuditSeverity::Info,
        "batch_started",
        &format!("batch started with {total} total rows"),
        serde_json::json!({"total": total, "pending": pending_rows.len()}),
        None,
    )
    .await;

    let mut successful = 0i64;
    let mut processed = (all_rows.len() - pending_rows.len()) as i64;
    let mut total_cost_minor_units = 0i64;
    let mut halted_by_error = None;

    for row in pending_rows {
        if cancellation.is_cancelled() {
            tracing::info!(job_id = %job_id, "engine loop observed cancellation, halting before next row");
            break;
        }

        progress.emit(ProgressEvent::RowStarted { row_number: row.row_number });

        let key = idempotency_key(job_id, row.row_number, &row.content_checksum, restart_epoch);
        shipctl_db::checkpoint_row_in_flight(pool, job_id, row.row_number, &key).await?;

        let request = ShipmentRequest {
            shipper_snapshot_json: shipper_snapshot_json.clone(),
            destination: row.order_snapshot.destination.clone(),
            weight_oz: row.order_snapshot.weight_oz,
            length_in: row.order_snapshot.length_in,
            width_in: row.order_snapshot.width_in,
            height_in: row.order_snapshot.height_in,
            service_code: row.order_snapshot.service_code.clone(),
            hs_code: row.order_snapshot.hs_code.clone(),
            declared_value_minor_units: row.order_snapshot.declared_value_minor_units,
            reference: row.order_snapshot.reference.clone(),
        };

        let outcome = match validate_request(&request) {
            Err(err) => Err(err),
            Ok(()) => carrier.create_shipment(&request, &key).await,
        };

        match outcome {
            Ok(result) => {
                let tracking = result.tracking_numbers.first().cloned().unwrap_or_default();
                shipctl_db::complete_row(
                    pool,
                    job_id,
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

                if write_back_enabled {
                    shipctl_db::enqueue_write_back(pool, job_id, row.row_number, &tracking, chrono::Utc::now()).await?;
                    write_back_signal.notify();
                }

                successful += 1;
                processed += 1;
                total_cost_minor_units += result.total_charges_minor_units;
                progress.emit(ProgressEvent::RowCompleted {
                    row_number: row.row_number,
                    tracking: tracking.clone(),
                    cost_minor_units: result.total_charges_minor_units,
                });
                audit(
                    pool,
                    decisions,
                    job_id,
                    AuditSeverity::Info,
                    "row_completed",
                    &format!("row {} completed", row.row_number),
                    serde_json::json!({
                        "row_number": row.row_number,
                        "tracking": tracking,
                        "cost_minor_units": result.total_charges_minor_units,
                    }),
                    Some(row.row_number),
                )
                .await;
            }
            Err(err) if err.is_retryable_transport() => {
                // C2 already exhausted its internal retry budget; anything
                // surfacing here is an ambiguous outcome (§4.2.1 step 5).
                shipctl_db::increment_row_recovery_attempt(pool, job_id, row.row_number).await?;
                tracing::warn!(job_id = %job_id, row = row.row_number, error = %err, "ambiguous carrier outcome, leaving row in_flight for recovery");
                audit(
                    pool,
                    decisions,
                    job_id,
                    AuditSeverity::Warning,
                    "row_ambiguous",
                    &format!("row {} left in_flight for recovery: {}", row.row_number, err.message),
                    serde_json::json!({"row_number": row.row_number, "error_code": err.code, "error_message": err.message}),
                    Some(row.row_number),
                )
                .await;
                halted_by_error = Some((err.code.to_string(), err.message.clone()));
                break;
            }
            Err(err) => {
                shipctl_db::fail_row(pool, job_id, row.row_number, err.code, &err.message).await?;
                processed += 1;
                progress.emit(ProgressEvent::RowFailed {
                    row_number: row.row_number,
                    error_code: err.code.to_string(),
                    error_message: err.message.clone(),
                });
                audit(
                    pool,
                    decisions,
                    job_id,
                    AuditSeverity::Error,
                    "row_failed",
                    &format!("row {} failed: {}", row.row_number, err.message),
                    serde_json::json!({"row_number": row.row_number, "error_code": err.code, "error_message": err.message}),
                    Some(row.row_number),
                )
                .await;
                halted_by_error = Some((err.code.to_string(), err.message));
                break;
            }
        }
    }

    match &halted_by_error {
        Some((code, message)) => {
            progress.emit(ProgressEvent::BatchFailed {
                error_code: code.clone(),
                error_message: message.clone(),
                processed,
            });
            audit(
                pool,
                decisions,
                job_id,
                AuditSeverity::Error,
                "batch_failed",
                &format!("batch halted: {message}"),
                serde_json::json!({"error_code": code, "error_message": message, "processed": processed}),
                None,
            )
            .await;
        }
        None => {
            progress.emit(ProgressEvent::BatchCompleted {
                total,
                successful,
                total_cost_minor_units,
            });
            audit(
                pool,
                decisions,
                job_id,
                AuditSeverity::Info,
                "batch_completed",
                &format!("batch completed: {successful}/{total} rows"),
                serde_json::json!({"total": total, "successful": successful, "total_cost_minor_units": total_cost_minor_units}),
                None,
            )
            .await;
        }
    }

    Ok(EngineOutcome {
        total,
        successful,
        processed,
        halted_by_error,
    })
}

/// `Arc`-backed adapter so a `tokio::sync::Notify` can serve as both
/// `WriteBackSignal` (engine side) and the wakeup the worker awaits on.
pub struct NotifyWriteBackSignal(pub Arc<tokio::sync::Notify>);

impl WriteBackSignal for NotifyWriteBackSignal {
    fn notify(&self) {
        self.0.notify_one();
    }
}

/// An `AtomicBool`-backed cancellation flag set by the orchestrator's
/// `Cancel` handler (§4.1).
pub struct AtomicCancellationSignal(pub Arc<std::sync::atomic::AtomicBool>);

impl CancellationSignal for AtomicCancellationSignal {
    fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
