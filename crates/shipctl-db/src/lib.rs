//! Durable state store (C1, §4.8). Transactional Postgres access via sqlx;
//! single-writer semantics come from row-level locking (`FOR UPDATE`), not
//! from serializing at the application layer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use shipctl_schemas::{ChargeBreakdown, JobMode, JobStatus, OrderSnapshot, RowStatus, WriteBackTaskStatus};

pub async fn connect_from_env() -> Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connect to DATABASE_URL failed")
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("migration failed")
}

#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub ok: bool,
    pub has_job_tables: bool,
}

pub async fn status(pool: &PgPool) -> Result<Status> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'jobs') AS has_jobs",
    )
    .fetch_one(pool)
    .await
    .context("status query failed")?;
    let has_job_tables: bool = row.try_get("has_jobs")?;
    Ok(Status {
        ok: true,
        has_job_tables,
    })
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Paused => "paused",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus> {
    Ok(match s {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "paused" => JobStatus::Paused,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => anyhow::bail!("unknown job status in store: {other}"),
    })
}

fn row_status_str(s: RowStatus) -> &'static str {
    match s {
        RowStatus::Pending => "pending",
        RowStatus::InFlight => "in_flight",
        RowStatus::Completed => "completed",
        RowStatus::Failed => "failed",
        RowStatus::Skipped => "skipped",
        RowStatus::NeedsReview => "needs_review",
    }
}

fn parse_row_status(s: &str) -> Result<RowStatus> {
    Ok(match s {
        "pending" => RowStatus::Pending,
        "in_flight" => RowStatus::InFlight,
        "completed" => RowStatus::Completed,
        "failed" => RowStatus::Failed,
        "skipped" => RowStatus::Skipped,
        "needs_review" => RowStatus::NeedsReview,
        other => anyhow::bail!("unknown row status in store: {other}"),
    })
}

fn wb_status_str(s: WriteBackTaskStatus) -> &'static str {
    match s {
        WriteBackTaskStatus::Pending => "pending",
        WriteBackTaskStatus::Completed => "completed",
        WriteBackTaskStatus::DeadLetter => "dead_letter",
    }
}

fn parse_wb_status(s: &str) -> Result<WriteBackTaskStatus> {
    Ok(match s {
        "pending" => WriteBackTaskStatus::Pending,
        "completed" => WriteBackTaskStatus::Completed,
        "dead_letter" => WriteBackTaskStatus::DeadLetter,
        other => anyhow::bail!("unknown write-back task status in store: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub struct NewJob {
    pub id: Uuid,
    pub name: String,
    pub command_text: String,
    pub mode: JobMode,
    pub write_back_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub command_text: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub transportation_minor_units: i64,
    pub duties_taxes_minor_units: i64,
    pub international_rows: i64,
    pub shipper_snapshot_json: Option<Value>,
    pub write_back_enabled: bool,
    pub source_signature: Option<String>,
    pub restart_epoch: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        command_text: row.try_get("command_text")?,
        status: parse_job_status(row.try_get("status")?)?,
        mode: match row.try_get::<String, _>("mode")?.as_str() {
            "confirm" => JobMode::Confirm,
            "auto" => JobMode::Auto,
            other => anyhow::bail!("unknown job mode in store: {other}"),
        },
        total_rows: row.try_get("total_rows")?,
        processed_rows: row.try_get("processed_rows")?,
        successful_rows: row.try_get("successful_rows")?,
        failed_rows: row.try_get("failed_rows")?,
        transportation_minor_units: row.try_get("transportation_minor_units")?,
        duties_taxes_minor_units: row.try_get("duties_taxes_minor_units")?,
        international_rows: row.try_get("international_rows")?,
        shipper_snapshot_json: row.try_get("shipper_snapshot_json")?,
        write_back_enabled: row.try_get("write_back_enabled")?,
        source_signature: row.try_get("source_signature")?,
        restart_epoch: row.try_get("restart_epoch")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_job(pool: &PgPool, new_job: &NewJob) -> Result<()> {
    sqlx::query(
        "INSERT INTO jobs (id, name, command_text, status, mode, write_back_enabled)
         VALUES ($1, $2, $3, 'pending', $4, $5)",
    )
    .bind(new_job.id)
    .bind(&new_job.name)
    .bind(&new_job.command_text)
    .bind(match new_job.mode {
        JobMode::Confirm => "confirm",
        JobMode::Auto => "auto",
    })
    .bind(new_job.write_back_enabled)
    .execute(pool)
    .await
    .context("insert job failed")?;
    Ok(())
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<JobRecord>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("get_job failed")?;
    row.as_ref().map(job_from_row).transpose()
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub name: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_jobs(pool: &PgPool, filter: &JobListFilter) -> Result<Vec<JobRecord>> {
    let status_str = filter.status.map(job_status_str);
    let rows = sqlx::query(
        "SELECT * FROM jobs
         WHERE ($1::text IS NULL OR status = $1)
           AND ($2::text IS NULL OR name ILIKE '%' || $2 || '%')
           AND ($3::timestamptz IS NULL OR created_at >= $3)
           AND ($4::timestamptz IS NULL OR created_at <= $4)
         ORDER BY created_at DESC
         LIMIT $5 OFFSET $6",
    )
    .bind(status_str)
    .bind(&filter.name)
    .bind(filter.created_after)
    .bind(filter.created_before)
    .bind(filter.limit.max(1))
    .bind(filter.offset.max(0))
    .fetch_all(pool)
    .await
    .context("list_jobs failed")?;

    rows.iter().map(job_from_row).collect()
}

/// Raw status write. Transition legality is enforced by the orchestrator's
/// state machine (shipctl-orchestrator) before this is ever called.
pub async fn set_job_status(pool: &PgPool, job_id: Uuid, status: JobStatus) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = $1, updated_at = now() WHERE id = $2")
        .bind(job_status_str(status))
        .bind(job_id)
        .execute(pool)
        .await
        .context("set_job_status failed")?;
    Ok(())
}

pub async fn mark_job_running(pool: &PgPool, job_id: Uuid, shipper_snapshot: &Value) -> Result<()> {
    sqlx::query(
        "UPDATE jobs
         SET status = 'running', started_at = now(), updated_at = now(), shipper_snapshot_json = $2
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(shipper_snapshot)
    .execute(pool)
    .await
    .context("mark_job_running failed")?;
    Ok(())
}

pub struct FinalizeJobArgs {
    pub status: JobStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Recompute and persist job aggregates from its rows, then transition to a
/// terminal state (§4.1 Finalization). The orchestrator calls this after C5
/// returns; the engine itself never performs the terminal transition.
pub async fn finalize_job(pool: &PgPool, job_id: Uuid, args: FinalizeJobArgs) -> Result<()> {
    let mut tx = pool.begin().await.context("begin finalize_job tx failed")?;

    let agg = sqlx::query(
        "SELECT
            COUNT(*) FILTER (WHERE job_rows.status IN ('completed','failed')) AS processed,
            COUNT(*) FILTER (WHERE job_rows.status = 'completed') AS successful,
            COUNT(*) FILTER (WHERE job_rows.status = 'failed') AS failed,
            COALESCE(SUM(cost_minor_units) FILTER (WHERE job_rows.status = 'completed'), 0) AS transportation,
            COALESCE(SUM(duties_taxes_minor_units) FILTER (WHERE job_rows.status = 'completed'), 0) AS duties,
            COUNT(*) FILTER (
                WHERE job_rows.status = 'completed'
                  AND destination_country IS DISTINCT FROM (SELECT shipper_snapshot_json ->> 'country_code' FROM jobs WHERE id = $1)
            ) AS international
         FROM job_rows WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await
    .context("aggregate job rows failed")?;

    let processed: i64 = agg.try_get("processed")?;
    let successful: i64 = agg.try_get("successful")?;
    let failed: i64 = agg.try_get("failed")?;
    let transportation: i64 = agg.try_get("transportation")?;
    let duties: i64 = agg.try_get("duties")?;
    let international: i64 = agg.try_get("international")?;

    sqlx::query(
        "UPDATE jobs
         SET status = $2, processed_rows = $3, successful_rows = $4, failed_rows = $5,
             transportation_minor_units = $6, duties_taxes_minor_units = $7, international_rows = $10,
             error_code = $8, error_message = $9, completed_at = now(), updated_at = now()
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(job_status_str(args.status))
    .bind(processed)
    .bind(successful)
    .bind(failed)
    .bind(transportation)
    .bind(duties)
    .bind(&args.error_code)
    .bind(&args.error_message)
    .bind(international)
    .execute(&mut *tx)
    .await
    .context("finalize_job update failed")?;

    tx.commit().await.context("commit finalize_job tx failed")?;
    Ok(())
}

/// Reset a job for an operator-confirmed "restart" (§4.2.8): bumps
/// `restart_epoch` (so recomputed idempotency keys never collide with the
/// pre-restart attempt), clears every row back to `pending` with its carrier
/// result fields wiped, and clears job-level aggregates/errors.
pub async fn restart_job(pool: &PgPool, job_id: Uuid) -> Result<i64> {
    let mut tx = pool.begin().await.context("begin restart_job tx failed")?;

    let row = sqlx::query("UPDATE jobs SET restart_epoch = restart_epoch + 1, processed_rows = 0, successful_rows = 0, failed_rows = 0, error_code = NULL, error_message = NULL, updated_at = now() WHERE id = $1 RETURNING restart_epoch")
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .context("bump restart_epoch failed")?;
    let new_epoch: i64 = row.try_get("restart_epoch")?;

    sqlx::query(
        "UPDATE job_rows
         SET status = 'pending', tracking_number = NULL, label_reference = NULL,
             cost_minor_units = NULL, duties_taxes_minor_units = NULL, destination_country = NULL,
             charge_breakdown_json = NULL, carrier_shipment_id = NULL, recovery_attempt_count = 0,
             error_code = NULL, error_message = NULL, processed_at = NULL
         WHERE job_id = $1 AND status != 'skipped'",
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await
    .context("reset job_rows for restart failed")?;

    tx.commit().await.context("commit restart_job tx failed")?;
    Ok(new_epoch)
}

pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("delete_job failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// JobRow
// ---------------------------------------------------------------------------

pub struct NewJobRow {
    pub row_number: i64,
    pub content_checksum: String,
    pub order_snapshot: OrderSnapshot,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct JobRowRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub row_number: i64,
    pub content_checksum: String,
    pub status: RowStatus,
    pub order_snapshot: OrderSnapshot,
    pub tracking_number: Option<String>,
    pub label_reference: Option<String>,
    pub cost_minor_units: Option<i64>,
    pub duties_taxes_minor_units: Option<i64>,
    pub destination_country: Option<String>,
    pub charge_breakdown: Option<ChargeBreakdown>,
    pub idempotency_key: String,
    pub carrier_shipment_id: Option<String>,
    pub recovery_attempt_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

fn job_row_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRowRecord> {
    let snapshot_json: Value = row.try_get("order_snapshot_json")?;
    let order_snapshot: OrderSnapshot =
        serde_json::from_value(snapshot_json).context("decode order_snapshot_json failed")?;
    let breakdown_json: Option<Value> = row.try_get("charge_breakdown_json")?;
    let charge_breakdown = breakdown_json
        .map(serde_json::from_value)
        .transpose()
        .context("decode charge_breakdown_json failed")?;

    Ok(JobRowRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        row_number: row.try_get("row_number")?,
        content_checksum: row.try_get("content_checksum")?,
        status: parse_row_status(row.try_get("status")?)?,
        order_snapshot,
        tracking_number: row.try_get("tracking_number")?,
        label_reference: row.try_get("label_reference")?,
        cost_minor_units: row.try_get("cost_minor_units")?,
        duties_taxes_minor_units: row.try_get("duties_taxes_minor_units")?,
        destination_country: row.try_get("destination_country")?,
        charge_breakdown,
        idempotency_key: row.try_get("idempotency_key")?,
        carrier_shipment_id: row.try_get("carrier_shipment_id")?,
        recovery_attempt_count: row.try_get("recovery_attempt_count")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

pub async fn insert_job_rows(pool: &PgPool, job_id: Uuid, rows: &[NewJobRow]) -> Result<()> {
    let mut tx = pool.begin().await.context("begin insert_job_rows tx failed")?;

    for r in rows {
        let snapshot_json =
            serde_json::to_value(&r.order_snapshot).context("encode order_snapshot failed")?;
        sqlx::query(
            "INSERT INTO job_rows (id, job_id, row_number, content_checksum, status, order_snapshot_json, idempotency_key)
             VALUES ($1, $2, $3, $4, 'pending', $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(r.row_number)
        .bind(&r.content_checksum)
        .bind(&snapshot_json)
        .bind(&r.idempotency_key)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("insert job_row {} failed", r.row_number))?;
    }

    sqlx::query("UPDATE jobs SET total_rows = $2, updated_at = now() WHERE id = $1")
        .bind(job_id)
        .bind(rows.len() as i64)
        .execute(&mut *tx)
        .await
        .context("update jobs.total_rows failed")?;

    tx.commit().await.context("commit insert_job_rows tx failed")?;
    Ok(())
}

pub async fn get_rows(pool: &PgPool, job_id: Uuid, status: Option<RowStatus>) -> Result<Vec<JobRowRecord>> {
    let status_str = status.map(row_status_str);
    let rows = sqlx::query(
        "SELECT * FROM job_rows WHERE job_id = $1 AND ($2::text IS NULL OR status = $2) ORDER BY row_number ASC",
    )
    .bind(job_id)
    .bind(status_str)
    .fetch_all(pool)
    .await
    .context("get_rows failed")?;
    rows.iter().map(job_row_from_row).collect()
}

pub async fn get_row_by_number(pool: &PgPool, job_id: Uuid, row_number: i64) -> Result<Option<JobRowRecord>> {
    let row = sqlx::query("SELECT * FROM job_rows WHERE job_id = $1 AND row_number = $2")
        .bind(job_id)
        .bind(row_number)
        .fetch_optional(pool)
        .await
        .context("get_row_by_number failed")?;
    row.as_ref().map(job_row_from_row).transpose()
}

/// §4.2.1 step 2: write the idempotency key and flip to `in_flight` before
/// any carrier call. Fails if the row is not currently `pending` — a
/// double-checkpoint would indicate the engine lost track of its own
/// cursor.
pub async fn checkpoint_row_in_flight(pool: &PgPool, job_id: Uuid, row_number: i64, idempotency_key: &str) -> Result<JobRowRecord> {
    let row = sqlx::query(
        "UPDATE job_rows SET status = 'in_flight', idempotency_key = $3
         WHERE job_id = $1 AND row_number = $2 AND status = 'pending'
         RETURNING *",
    )
    .bind(job_id)
    .bind(row_number)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("checkpoint_row_in_flight failed")?;

    match row {
        Some(r) => job_row_from_row(&r),
        None => anyhow::bail!("row {row_number} of job {job_id} is not pending; cannot checkpoint"),
    }
}

pub struct CompleteRowArgs<'a> {
    pub tracking_number: &'a str,
    pub label_reference: Option<&'a str>,
    pub cost_minor_units: i64,
    pub duties_taxes_minor_units: i64,
    pub destination_country: &'a str,
    pub charge_breakdown: ChargeBreakdown,
    pub carrier_shipment_id: &'a str,
}

pub async fn complete_row(pool: &PgPool, job_id: Uuid, row_number: i64, args: CompleteRowArgs<'_>) -> Result<()> {
    let breakdown_json = serde_json::to_value(&args.charge_breakdown)?;
    sqlx::query(
        "UPDATE job_rows
         SET status = 'completed', tracking_number = $3, label_reference = $4,
             cost_minor_units = $5, duties_taxes_minor_units = $6, destination_country = $7,
             charge_breakdown_json = $8, carrier_shipment_id = $9, processed_at = now()
         WHERE job_id = $1 AND row_number = $2",
    )
    .bind(job_id)
    .bind(row_number)
    .bind(args.tracking_number)
    .bind(args.label_reference)
    .bind(args.cost_minor_units)
    .bind(args.duties_taxes_minor_units)
    .bind(args.destination_country)
    .bind(&breakdown_json)
    .bind(args.carrier_shipment_id)
    .execute(pool)
    .await
    .context("complete_row failed")?;
    Ok(())
}

pub async fn fail_row(pool: &PgPool, job_id: Uuid, row_number: i64, error_code: &str, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE job_rows SET status = 'failed', error_code = $3, error_message = $4, processed_at = now()
         WHERE job_id = $1 AND row_number = $2",
    )
    .bind(job_id)
    .bind(row_number)
    .bind(error_code)
    .bind(error_message)
    .execute(pool)
    .await
    .context("fail_row failed")?;
    Ok(())
}

pub async fn increment_row_recovery_attempt(pool: &PgPool, job_id: Uuid, row_number: i64) -> Result<i64> {
    let row = sqlx::query(
        "UPDATE job_rows SET recovery_attempt_count = recovery_attempt_count + 1
         WHERE job_id = $1 AND row_number = $2 RETURNING recovery_attempt_count",
    )
    .bind(job_id)
    .bind(row_number)
    .fetch_one(pool)
    .await
    .context("increment_row_recovery_attempt failed")?;
    Ok(row.try_get("recovery_attempt_count")?)
}

pub async fn mark_row_needs_review(pool: &PgPool, job_id: Uuid, row_number: i64) -> Result<()> {
    sqlx::query("UPDATE job_rows SET status = 'needs_review', processed_at = now() WHERE job_id = $1 AND row_number = $2")
        .bind(job_id)
        .bind(row_number)
        .execute(pool)
        .await
        .context("mark_row_needs_review failed")?;
    Ok(())
}

/// §6.1 `PATCH /jobs/{id}/rows/skip`: only rows still `pending` may be
/// skipped; returns the number of rows actually affected.
pub async fn skip_pending_rows(pool: &PgPool, job_id: Uuid, row_numbers: &[i64]) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE job_rows SET status = 'skipped', processed_at = now()
         WHERE job_id = $1 AND status = 'pending' AND row_number = ANY($2)",
    )
    .bind(job_id)
    .bind(row_numbers)
    .execute(pool)
    .await
    .context("skip_pending_rows failed")?;
    Ok(result.rows_affected())
}

/// §4.7 step 1: in-flight rows belonging to jobs left `running`/`paused`.
pub async fn list_in_flight_rows_for_recoverable_jobs(pool: &PgPool) -> Result<Vec<JobRowRecord>> {
    let rows = sqlx::query(
        "SELECT jr.* FROM job_rows jr
         JOIN jobs j ON j.id = jr.job_id
         WHERE jr.status = 'in_flight' AND j.status IN ('running','paused')
         ORDER BY j.created_at ASC, jr.row_number ASC",
    )
    .fetch_all(pool)
    .await
    .context("list_in_flight_rows_for_recoverable_jobs failed")?;
    rows.iter().map(job_row_from_row).collect()
}

/// Completed rows with no corresponding write-back task (crash window
/// between §4.2.1 step 5's "mark completed" and "enqueue write-back").
pub async fn find_completed_rows_missing_write_back(pool: &PgPool, job_id: Uuid) -> Result<Vec<JobRowRecord>> {
    let rows = sqlx::query(
        "SELECT jr.* FROM job_rows jr
         LEFT JOIN write_back_tasks t ON t.job_id = jr.job_id AND t.row_number = jr.row_number
         WHERE jr.job_id = $1 AND jr.status = 'completed' AND t.id IS NULL
         ORDER BY jr.row_number ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("find_completed_rows_missing_write_back failed")?;
    rows.iter().map(job_row_from_row).collect()
}

pub async fn list_jobs_with_status(pool: &PgPool, status: JobStatus) -> Result<Vec<JobRecord>> {
    let rows = sqlx::query("SELECT * FROM jobs WHERE status = $1 ORDER BY created_at ASC")
        .bind(job_status_str(status))
        .fetch_all(pool)
        .await
        .context("list_jobs_with_status failed")?;
    rows.iter().map(job_from_row).collect()
}

// ---------------------------------------------------------------------------
// WriteBackTask (C4)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WriteBackTaskRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub row_number: i64,
    pub tracking: String,
    pub shipped_at: DateTime<Utc>,
    pub status: WriteBackTaskStatus,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

fn wb_task_from_row(row: &sqlx::postgres::PgRow) -> Result<WriteBackTaskRecord> {
    Ok(WriteBackTaskRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        row_number: row.try_get("row_number")?,
        tracking: row.try_get("tracking")?,
        shipped_at: row.try_get("shipped_at")?,
        status: parse_wb_status(row.try_get("status")?)?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
    })
}

pub const WRITE_BACK_MAX_RETRIES: i64 = 5;

/// Upsert by (job_id, row_number); a second enqueue overwrites tracking
/// while preserving retry_count (§4.5).
pub async fn enqueue_write_back(pool: &PgPool, job_id: Uuid, row_number: i64, tracking: &str, shipped_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO write_back_tasks (id, job_id, row_number, tracking, shipped_at, status, retry_count)
         VALUES ($1, $2, $3, $4, $5, 'pending', 0)
         ON CONFLICT (job_id, row_number)
         DO UPDATE SET tracking = EXCLUDED.tracking, shipped_at = EXCLUDED.shipped_at,
                       status = 'pending'",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(row_number)
    .bind(tracking)
    .bind(shipped_at)
    .execute(pool)
    .await
    .context("enqueue_write_back failed")?;
    Ok(())
}

pub async fn list_pending_write_back_tasks(pool: &PgPool, job_id: Uuid) -> Result<Vec<WriteBackTaskRecord>> {
    let rows = sqlx::query("SELECT * FROM write_back_tasks WHERE job_id = $1 AND status = 'pending' ORDER BY row_number ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .context("list_pending_write_back_tasks failed")?;
    rows.iter().map(wb_task_from_row).collect()
}

pub async fn mark_write_back_completed(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE write_back_tasks SET status = 'completed' WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("mark_write_back_completed failed")?;
    Ok(())
}

/// Increments retry_count; dead-letters once it reaches the max (§3
/// invariant, §8 invariant 3).
pub async fn retry_or_dead_letter_write_back(pool: &PgPool, task_id: Uuid) -> Result<WriteBackTaskStatus> {
    let row = sqlx::query(
        "UPDATE write_back_tasks
         SET retry_count = retry_count + 1,
             status = CASE WHEN retry_count + 1 >= $2 THEN 'dead_letter' ELSE 'pending' END
         WHERE id = $1
         RETURNING status",
    )
    .bind(task_id)
    .bind(WRITE_BACK_MAX_RETRIES)
    .fetch_one(pool)
    .await
    .context("retry_or_dead_letter_write_back failed")?;
    parse_wb_status(row.try_get("status")?)
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditSeverity {
    fn as_str(self) -> &'static str {
        match self {
            AuditSeverity::Debug => "debug",
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEventRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub severity: String,
    pub event_type: String,
    pub message: String,
    pub detail_json: Value,
    pub row_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Appends an audit event with sensitive fields redacted out of `detail`
/// first (§6.3, §9a). Never updated once written.
pub async fn append_audit_event(
    pool: &PgPool,
    job_id: Uuid,
    severity: AuditSeverity,
    event_type: &str,
    message: &str,
    mut detail: Value,
    row_number: Option<i64>,
) -> Result<()> {
    shipctl_audit::redact_sensitive(&mut detail);
    sqlx::query(
        "INSERT INTO audit_events (id, job_id, severity, event_type, message, detail_json, row_number)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(severity.as_str())
    .bind(event_type)
    .bind(message)
    .bind(&detail)
    .bind(row_number)
    .execute(pool)
    .await
    .context("append_audit_event failed")?;
    Ok(())
}

pub async fn list_audit_events(pool: &PgPool, job_id: Uuid, level: Option<&str>, event_type: Option<&str>, limit: i64) -> Result<Vec<AuditEventRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM audit_events
         WHERE job_id = $1
           AND ($2::text IS NULL OR severity = $2)
           AND ($3::text IS NULL OR event_type = $3)
         ORDER BY created_at DESC
         LIMIT $4",
    )
    .bind(job_id)
    .bind(level)
    .bind(event_type)
    .bind(limit.max(1))
    .fetch_all(pool)
    .await
    .context("list_audit_events failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(AuditEventRecord {
                id: row.try_get("id")?,
                job_id: row.try_get("job_id")?,
                severity: row.try_get("severity")?,
                event_type: row.try_get("event_type")?,
                message: row.try_get("message")?,
                detail_json: row.try_get("detail_json")?,
                row_number: row.try_get("row_number")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// DecisionRun (ledger metadata; the hash-chained events themselves live in a
// shipctl-audit-managed JSONL file referenced by ledger_path)
// ---------------------------------------------------------------------------

pub async fn register_decision_run(pool: &PgPool, run_id: Uuid, job_id: Uuid, ledger_path: &str) -> Result<()> {
    sqlx::query("INSERT INTO decision_runs (run_id, job_id, ledger_path) VALUES ($1, $2, $3)")
        .bind(run_id)
        .bind(job_id)
        .bind(ledger_path)
        .execute(pool)
        .await
        .context("register_decision_run failed")?;
    Ok(())
}

pub async fn update_decision_run_progress(pool: &PgPool, run_id: Uuid, event_count: i64, last_event_hash: &str) -> Result<()> {
    sqlx::query("UPDATE decision_runs SET event_count = $2, last_event_hash = $3 WHERE run_id = $1")
        .bind(run_id)
        .bind(event_count)
        .bind(last_event_hash)
        .execute(pool)
        .await
        .context("update_decision_run_progress failed")?;
    Ok(())
}
