//! Typed carrier client (C2, §4.3). One live adapter (`UpsCarrier`, OAuth2
//! client-credentials over HTTP/JSON) and one deterministic in-memory stub
//! (`PaperCarrier`) selected by `SHIPCTL_MODE`; both implement `CarrierAdapter`
//! so the engine never branches on mode.

mod error;
mod normalize;
mod paper;
mod ups;

pub use error::CarrierError;
pub use paper::PaperCarrier;
pub use ups::UpsCarrier;

use async_trait::async_trait;
use shipctl_schemas::{AddressValidationResult, RateQuote, RateResult, ShipmentResult};

/// A carrier shipment request: everything §4.2.1 step 3 assembles from the
/// row's order snapshot plus the resolved shipper.
#[derive(Debug, Clone)]
pub struct ShipmentRequest {
    pub shipper_snapshot_json: serde_json::Value,
    pub destination: shipctl_schemas::Address,
    pub weight_oz: i64,
    pub length_in: i64,
    pub width_in: i64,
    pub height_in: i64,
    pub service_code: String,
    pub hs_code: Option<String>,
    pub declared_value_minor_units: i64,
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct RateRequest {
    pub shipper_snapshot_json: serde_json::Value,
    pub destination: shipctl_schemas::Address,
    pub weight_oz: i64,
    pub service_code: String,
}

#[derive(Debug, Clone)]
pub struct ShopRatesRequest {
    pub shipper_snapshot_json: serde_json::Value,
    pub destination: shipctl_schemas::Address,
    pub weight_oz: i64,
}

#[derive(Debug, Clone)]
pub struct AddressToValidate {
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state_province_code: String,
    pub postal_code: String,
    pub country_code: String,
}

/// The single choke-point the engine (C5) and orchestrator (C7/C8) call
/// through, regardless of which mode selected the concrete adapter.
#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
        idempotency_key: &str,
    ) -> Result<ShipmentResult, CarrierError>;

    async fn get_rate(&self, request: &RateRequest) -> Result<RateResult, CarrierError>;

    async fn shop_rates(&self, request: &ShopRatesRequest) -> Result<Vec<RateQuote>, CarrierError>;

    async fn validate_address(
        &self,
        address: &AddressToValidate,
    ) -> Result<AddressValidationResult, CarrierError>;

    async fn void_shipment(&self, shipment_id: &str) -> Result<(), CarrierError>;

    /// §4.2.5: look up a previously created shipment by the idempotency key
    /// that was passed to `create_shipment`. Used by the recovery
    /// coordinator to resolve `in_flight` rows after a crash.
    async fn find_shipment_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ShipmentResult>, CarrierError>;
}
