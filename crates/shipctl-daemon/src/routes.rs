//! Axum router and all HTTP handlers for shipctl-daemon (§6.1).
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! layers after this call so tests can compose the bare router.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use shipctl_db::JobListFilter;
use shipctl_schemas::{JobMode, JobStatus, RowStatus};

use crate::api_types::*;
use crate::error::AppError;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/commands", post(create_command))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/v1/jobs/:id/status", patch(patch_job_status))
        .route("/api/v1/jobs/:id/rows", get(list_rows))
        .route("/api/v1/jobs/:id/rows/skip", patch(skip_rows))
        .route("/api/v1/jobs/:id/preview", get(preview))
        .route("/api/v1/jobs/:id/confirm", post(confirm))
        .route("/api/v1/jobs/:id/progress", get(progress))
        .route("/api/v1/jobs/:id/progress/stream", get(progress_stream))
        .route("/api/v1/jobs/:id/logs", get(logs))
        .route("/api/v1/jobs/:id/errors", get(errors))
        .route("/api/v1/jobs/:id/export", get(export))
        .route("/api/v1/jobs/:id/recovery", get(recovery_info).post(recovery_apply))
        .route("/api/v1/labels/:tracking", get(label_by_tracking))
        .route("/api/v1/jobs/:id/labels/:row_number", get(label_for_row))
        .route("/api/v1/jobs/:id/labels/zip", get(labels_zip))
        .route("/api/v1/jobs/:id/labels/merged", get(labels_merged))
        .route("/api/v1/healthz", get(healthz))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /api/v1/commands
// ---------------------------------------------------------------------------

/// Creates a job with zero rows and status `pending`, recording the raw
/// command text. A real deployment wires an external NL resolver in front
/// of this to populate rows before preview; that seam is deliberately left
/// explicit rather than faked in-process (§6.1).
async fn create_command(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    let job_id = Uuid::new_v4();
    let new_job = shipctl_db::NewJob {
        id: job_id,
        name: body.command.clone(),
        command_text: body.command,
        mode: JobMode::Confirm,
        write_back_enabled: true,
    };
    shipctl_db::insert_job(&st.pool, &new_job).await.map_err(anyhow::Error::from)?;
    Ok(Json(CommandResponse { job_id, status: JobStatus::Pending }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs
// ---------------------------------------------------------------------------

async fn list_jobs(
    State(st): State<Arc<AppState>>,
    Query(q): Query<JobListQuery>,
) -> Result<Json<Vec<JobSummary>>, AppError> {
    let filter = JobListFilter {
        status: q.status,
        name: q.name,
        created_after: q.created_after,
        created_before: q.created_before,
        limit: q.limit.unwrap_or(50),
        offset: q.offset.unwrap_or(0),
    };
    let jobs = shipctl_db::list_jobs(&st.pool, &filter).await.map_err(anyhow::Error::from)?;
    Ok(Json(jobs.into_iter().map(JobSummary::from).collect()))
}

// ---------------------------------------------------------------------------
// GET/DELETE /api/v1/jobs/:id
// ---------------------------------------------------------------------------

async fn get_job(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<JobDetail>, AppError> {
    let job = shipctl_db::get_job(&st.pool, id)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job.into()))
}

async fn delete_job(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    shipctl_db::delete_job(&st.pool, id).await.map_err(anyhow::Error::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/jobs/:id/status
// ---------------------------------------------------------------------------

async fn patch_job_status(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusPatchRequest>,
) -> Result<Json<JobDetail>, AppError> {
    let job = shipctl_db::get_job(&st.pool, id)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;

    shipctl_orchestrator::job_state_machine::check_transition(job.status, body.status)
        .map_err(|e| AppError::InvalidTransition(e.to_string()))?;
    shipctl_db::set_job_status(&st.pool, id, body.status).await.map_err(anyhow::Error::from)?;

    let updated = shipctl_db::get_job(&st.pool, id)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;
    Ok(Json(updated.into()))
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs/:id/rows
// ---------------------------------------------------------------------------

async fn list_rows(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<RowsQuery>,
) -> Result<Json<Vec<RowDetail>>, AppError> {
    let rows = shipctl_db::get_rows(&st.pool, id, q.status).await.map_err(anyhow::Error::from)?;
    Ok(Json(rows.into_iter().map(RowDetail::from).collect()))
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/jobs/:id/rows/skip
// ---------------------------------------------------------------------------

async fn skip_rows(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SkipRowsRequest>,
) -> Result<Json<SkipRowsResponse>, AppError> {
    let job = shipctl_db::get_job(&st.pool, id)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;
    if job.status != JobStatus::Pending {
        return Err(AppError::InvalidTransition(
            "rows can only be skipped while the job is pending".to_string(),
        ));
    }
    let skipped = shipctl_db::skip_pending_rows(&st.pool, id, &body.row_numbers)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(SkipRowsResponse { skipped }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs/:id/preview
// ---------------------------------------------------------------------------

const PREVIEW_DETAIL_ROWS: usize = 20;

async fn preview(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<PreviewResponse>, AppError> {
    let rows = shipctl_db::get_rows(&st.pool, id, None).await.map_err(anyhow::Error::from)?;
    let total_rows = rows.len() as i64;

    let detailed: Vec<RowDetail> = rows.iter().take(PREVIEW_DETAIL_ROWS).cloned().map(RowDetail::from).collect();

    let mut by_status: Vec<(RowStatus, i64)> = Vec::new();
    for row in rows.iter().skip(PREVIEW_DETAIL_ROWS) {
        if let Some(entry) = by_status.iter_mut().find(|(s, _)| *s == row.status) {
            entry.1 += 1;
        } else {
            by_status.push((row.status, 1));
        }
    }

    Ok(Json(PreviewResponse { total_rows, detailed, remaining_by_status: by_status }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/jobs/:id/confirm
// ---------------------------------------------------------------------------

async fn confirm(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<ConfirmResponse>, AppError> {
    st.orchestrator.confirm(id).await.map_err(AppError::from)?;
    Ok(Json(ConfirmResponse { status: "confirmed" }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs/:id/progress
// ---------------------------------------------------------------------------

async fn progress(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<ProgressSnapshot>, AppError> {
    let job = shipctl_db::get_job(&st.pool, id)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job.into()))
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs/:id/progress/stream
// ---------------------------------------------------------------------------

/// §6.4: frames are unnamed `message` events carrying `{event, data}`. The
/// hub's `Subscription` already emits a `Ping` event every 15s of silence
/// (§4.6), so this handler is a thin SSE adapter over it.
async fn progress_stream(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let subscription = st.hub.subscribe(id);
    let events = subscription.into_stream().map(|event| -> Result<Event, Infallible> {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::new()).into_response()
}

// ---------------------------------------------------------------------------
// GET /api/v1/jobs/:id/logs, /errors, /export
// ---------------------------------------------------------------------------

async fn logs(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEventResponse>>, AppError> {
    let events = shipctl_db::list_audit_events(&st.pool, id, q.level.as_deref(), q.event_type.as_deref(), q.limit.unwrap_or(200))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(events.into_iter().map(AuditEventResponse::from).collect()))
}

async fn errors(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<Vec<AuditEventResponse>>, AppError> {
    let events = shipctl_db::list_audit_events(&st.pool, id, Some("error"), None, 500)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(events.into_iter().map(AuditEventResponse::from).collect()))
}

/// Plain-text export with a `Content-Disposition: attachment` header (§6.1).
async fn export(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let events = shipctl_db::list_audit_events(&st.pool, id, None, None, 10_000)
        .await
        .map_err(anyhow::Error::from)?;

    let mut body = String::new();
    for e in events {
        body.push_str(&format!("{} [{}] {}: {}\n", e.created_at.to_rfc3339(), e.severity, e.event_type, e.message));
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"job-{id}-audit.txt\"")),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET/POST /api/v1/jobs/:id/recovery
// ---------------------------------------------------------------------------

async fn recovery_info(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<shipctl_schemas::InterruptedJobInfo>>, AppError> {
    let info = st.orchestrator.interrupted_job_info(id).await.map_err(AppError::from)?;
    Ok(Json(info))
}

async fn recovery_apply(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RecoveryChoiceRequest>,
) -> Result<Json<RecoveryChoiceResponse>, AppError> {
    let result = st.orchestrator.apply_recovery_choice(id, body.choice).await.map_err(AppError::from)?;
    Ok(Json(result.into()))
}

// ---------------------------------------------------------------------------
// Label retrieval (§6.1: confined to the labels root, 403 on escape)
// ---------------------------------------------------------------------------

async fn read_confined_label(st: &AppState, relative: &str) -> Result<Vec<u8>, AppError> {
    let path = st
        .labels
        .confine(relative)
        .map_err(|e| AppError::Forbidden(e.to_string()))?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::NotFound(format!("label not found: {e}")))
}

async fn label_by_tracking(State(st): State<Arc<AppState>>, Path(tracking): Path<String>) -> Result<Response, AppError> {
    let bytes = read_confined_label(&st, &format!("{tracking}.pdf")).await?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/pdf")], bytes).into_response())
}

async fn label_for_row(
    State(st): State<Arc<AppState>>,
    Path((id, row_number)): Path<(Uuid, i64)>,
) -> Result<Response, AppError> {
    let row = shipctl_db::get_row_by_number(&st.pool, id, row_number)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound(format!("row {row_number} not found on job {id}")))?;
    let reference = row
        .label_reference
        .ok_or_else(|| AppError::NotFound("row has no label reference".to_string()))?;
    let bytes = read_confined_label(&st, &reference).await?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/pdf")], bytes).into_response())
}

/// Bundles every completed row's label into a single zip archive.
async fn labels_zip(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let rows = shipctl_db::get_rows(&st.pool, id, Some(RowStatus::Completed))
        .await
        .map_err(anyhow::Error::from)?;

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for row in rows {
            let Some(reference) = row.label_reference.clone() else { continue };
            let Ok(path) = st.labels.confine(&reference) else { continue };
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            writer
                .start_file(format!("row-{}-{}.pdf", row.row_number, reference), options)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            std::io::Write::write_all(&mut writer, &bytes).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        }
        writer.finish().map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"job-{id}-labels.zip\"")),
        ],
        buf.into_inner(),
    )
        .into_response())
}

/// Concatenates every completed row's label bytes into one blob. Labels are
/// opaque carrier-issued PDFs; this is a byte-level merge, not a PDF page
/// merge, matching what the carrier adapters actually hand back (§4.3).
async fn labels_merged(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let rows = shipctl_db::get_rows(&st.pool, id, Some(RowStatus::Completed))
        .await
        .map_err(anyhow::Error::from)?;

    let mut merged = Vec::new();
    for row in rows {
        let Some(reference) = row.label_reference else { continue };
        let Ok(path) = st.labels.confine(&reference) else { continue };
        if let Ok(bytes) = tokio::fs::read(&path).await {
            merged.extend_from_slice(&bytes);
        }
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"job-{id}-labels-merged.pdf\"")),
        ],
        merged,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET /api/v1/healthz
// ---------------------------------------------------------------------------

async fn healthz(State(st): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let status = shipctl_db::status(&st.pool).await.map_err(anyhow::Error::from)?;
    Ok(Json(HealthResponse { ok: status.ok, has_job_tables: status.has_job_tables }))
}
