use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job lifecycle state (§4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Confirm,
    Auto,
}

/// JobRow lifecycle state (§3 JobRow, §4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    Skipped,
    NeedsReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteBackTaskStatus {
    Pending,
    Completed,
    DeadLetter,
}

/// A postal address, used both for shipper snapshots and destination fields
/// on an order snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Address {
    pub name: String,
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state_province_code: String,
    pub postal_code: String,
    pub country_code: String,
    pub phone: String,
}

/// The row's order snapshot: everything the carrier request mapping (§4.2.1
/// step 3) needs, captured once at job-row creation so later execution never
/// re-reads the original source mid-batch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderSnapshot {
    pub destination: Address,
    pub weight_oz: i64,
    pub length_in: i64,
    pub width_in: i64,
    pub height_in: i64,
    pub service_code: String,
    pub hs_code: Option<String>,
    pub declared_value_minor_units: i64,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ChargeBreakdown {
    pub transportation_minor_units: i64,
    pub duties_taxes_minor_units: i64,
}

/// Canonical, carrier-agnostic shipment result (§4.3 response normalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentResult {
    pub tracking_numbers: Vec<String>,
    pub label_data: Vec<String>,
    pub shipment_id: String,
    pub total_charges_minor_units: i64,
    pub currency_code: String,
    pub breakdown: ChargeBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateResult {
    pub total_charges_minor_units: i64,
    pub currency_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateQuote {
    pub service_code: String,
    pub total_charges_minor_units: i64,
    pub currency_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressValidationStatus {
    Valid,
    Ambiguous,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressCandidate {
    pub address_lines: Vec<String>,
    pub city: String,
    pub state_province_code: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressValidationResult {
    pub status: AddressValidationStatus,
    pub candidates: Vec<AddressCandidate>,
}

/// Outcome of a shipment lookup performed by the recovery coordinator (C8)
/// against an idempotency key or a previously recorded carrier shipment id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShipmentLookup {
    Found(ShipmentResult),
    NotFound,
    Ambiguous,
}

/// §4.2.4 progress events. Variant-tagged, as the spec's design notes (§9)
/// require for anything that was a class hierarchy in the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        total: i64,
    },
    RowStarted {
        row_number: i64,
    },
    RowCompleted {
        row_number: i64,
        tracking: String,
        cost_minor_units: i64,
    },
    RowFailed {
        row_number: i64,
        error_code: String,
        error_message: String,
    },
    BatchCompleted {
        total: i64,
        successful: i64,
        total_cost_minor_units: i64,
    },
    BatchFailed {
        error_code: String,
        error_message: String,
        processed: i64,
    },
    Ping,
}

/// A job summary row number and one carrier result, ready for the write-back
/// queue (§3 WriteBackTask, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackUpdate {
    pub row_number: i64,
    pub tracking: String,
    pub shipped_at: DateTime<Utc>,
}

/// §4.2.8 recovery prompt choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryChoice {
    Resume,
    Restart,
    Cancel,
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptedJobInfo {
    pub job_id: Uuid,
    pub job_name: String,
    pub completed_rows: i64,
    pub total_rows: i64,
    pub remaining_rows: i64,
    pub last_row_number: Option<i64>,
    pub last_tracking_number: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub in_flight_count: i64,
    pub needs_review_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRowDetail {
    pub row_number: i64,
    pub status: RowStatus,
    pub error_message: Option<String>,
    pub carrier_tracking: Option<String>,
    pub carrier_shipment_id: Option<String>,
    pub idempotency_key: String,
    pub recovery_attempt_count: i64,
}
