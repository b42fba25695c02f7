//! Request/response DTOs for the §6.1 HTTP surface. Kept separate from
//! `routes.rs` so the wire shapes are easy to scan in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shipctl_db::JobRecord;
use shipctl_schemas::{JobMode, JobStatus, RowStatus};

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<JobStatus>,
    pub name: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub created_at: DateTime<Utc>,
}

impl From<JobRecord> for JobSummary {
    fn from(j: JobRecord) -> Self {
        Self {
            id: j.id,
            name: j.name,
            status: j.status,
            mode: j.mode,
            total_rows: j.total_rows,
            processed_rows: j.processed_rows,
            successful_rows: j.successful_rows,
            failed_rows: j.failed_rows,
            created_at: j.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
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
    pub write_back_enabled: bool,
    pub restart_epoch: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobDetail {
    fn from(j: JobRecord) -> Self {
        Self {
            id: j.id,
            name: j.name,
            command_text: j.command_text,
            status: j.status,
            mode: j.mode,
            total_rows: j.total_rows,
            processed_rows: j.processed_rows,
            successful_rows: j.successful_rows,
            failed_rows: j.failed_rows,
            transportation_minor_units: j.transportation_minor_units,
            duties_taxes_minor_units: j.duties_taxes_minor_units,
            international_rows: j.international_rows,
            write_back_enabled: j.write_back_enabled,
            restart_epoch: j.restart_epoch,
            error_code: j.error_code,
            error_message: j.error_message,
            created_at: j.created_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusPatchRequest {
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct RowsQuery {
    pub status: Option<RowStatus>,
}

#[derive(Debug, Deserialize)]
pub struct SkipRowsRequest {
    pub row_numbers: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct SkipRowsResponse {
    pub skipped: u64,
}

#[derive(Debug, Serialize)]
pub struct RowDetail {
    pub row_number: i64,
    pub status: RowStatus,
    pub tracking_number: Option<String>,
    pub cost_minor_units: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl From<shipctl_db::JobRowRecord> for RowDetail {
    fn from(r: shipctl_db::JobRowRecord) -> Self {
        Self {
            row_number: r.row_number,
            status: r.status,
            tracking_number: r.tracking_number,
            cost_minor_units: r.cost_minor_units,
            error_code: r.error_code,
            error_message: r.error_message,
        }
    }
}

/// §6.1 preview: first N rows detailed, the rest aggregated by status.
#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub total_rows: i64,
    pub detailed: Vec<RowDetail>,
    pub remaining_by_status: Vec<(RowStatus, i64)>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub transportation_minor_units: i64,
    pub duties_taxes_minor_units: i64,
}

impl From<JobRecord> for ProgressSnapshot {
    fn from(j: JobRecord) -> Self {
        Self {
            status: j.status,
            total_rows: j.total_rows,
            processed_rows: j.processed_rows,
            successful_rows: j.successful_rows,
            failed_rows: j.failed_rows,
            transportation_minor_units: j.transportation_minor_units,
            duties_taxes_minor_units: j.duties_taxes_minor_units,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub level: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditEventResponse {
    pub id: Uuid,
    pub severity: String,
    pub event_type: String,
    pub message: String,
    pub detail: serde_json::Value,
    pub row_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<shipctl_db::AuditEventRecord> for AuditEventResponse {
    fn from(e: shipctl_db::AuditEventRecord) -> Self {
        Self {
            id: e.id,
            severity: e.severity,
            event_type: e.event_type,
            message: e.message,
            detail: e.detail_json,
            row_number: e.row_number,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecoveryChoiceRequest {
    pub choice: shipctl_schemas::RecoveryChoice,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecoveryChoiceResponse {
    Resumed,
    Restarted { duplicate_risk_rows: i64, restart_epoch: i64 },
    Cancelled,
    Review { rows: Vec<shipctl_schemas::ReviewRowDetail> },
}

impl From<shipctl_orchestrator::RecoveryChoiceResult> for RecoveryChoiceResponse {
    fn from(r: shipctl_orchestrator::RecoveryChoiceResult) -> Self {
        match r {
            shipctl_orchestrator::RecoveryChoiceResult::Resumed => Self::Resumed,
            shipctl_orchestrator::RecoveryChoiceResult::Restarted { duplicate_risk_rows, restart_epoch } => {
                Self::Restarted { duplicate_risk_rows, restart_epoch }
            }
            shipctl_orchestrator::RecoveryChoiceResult::Cancelled => Self::Cancelled,
            shipctl_orchestrator::RecoveryChoiceResult::Review(rows) => Self::Review { rows },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub has_job_tables: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub error_message: String,
}
