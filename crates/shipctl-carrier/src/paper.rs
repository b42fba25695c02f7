use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use shipctl_schemas::{
    AddressCandidate, AddressValidationResult, AddressValidationStatus, ChargeBreakdown,
    RateQuote, RateResult, ShipmentResult,
};

use crate::error::CarrierError;
use crate::{AddressToValidate, CarrierAdapter, RateRequest, ShipmentRequest, ShopRatesRequest};

/// Deterministic in-memory carrier stub for `SHIPCTL_MODE=paper` (§6.3,
/// Glossary "Paper mode"). No randomness, no wall-clock-derived values other
/// than a fixed nominal cost; submit is idempotent keyed by the idempotency
/// key passed in, matching the live adapter's idempotent-create contract.
#[derive(Default)]
pub struct PaperCarrier {
    shipments: Mutex<BTreeMap<String, ShipmentResult>>,
}

const PAPER_TRANSPORTATION_MINOR_UNITS: i64 = 850;
const PAPER_DUTIES_MINOR_UNITS: i64 = 0;

impl PaperCarrier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CarrierAdapter for PaperCarrier {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
        idempotency_key: &str,
    ) -> Result<ShipmentResult, CarrierError> {
        let mut shipments = self.shipments.lock().expect("paper carrier mutex poisoned");

        if let Some(existing) = shipments.get(idempotency_key) {
            return Ok(existing.clone());
        }

        if request.destination.country_code.is_empty() {
            return Err(CarrierError::address_validation_failed(
                "destination country code is required",
            ));
        }
        if request.service_code.is_empty() {
            return Err(CarrierError::service_not_available(
                "no service code selected for paper shipment",
            ));
        }

        let tracking = format!("PAPER-{idempotency_key}");
        let result = ShipmentResult {
            tracking_numbers: vec![tracking.clone()],
            label_data: vec![format!("paper-label:{idempotency_key}")],
            shipment_id: format!("paper-shipment:{idempotency_key}"),
            total_charges_minor_units: PAPER_TRANSPORTATION_MINOR_UNITS + PAPER_DUTIES_MINOR_UNITS,
            currency_code: "USD".to_string(),
            breakdown: ChargeBreakdown {
                transportation_minor_units: PAPER_TRANSPORTATION_MINOR_UNITS,
                duties_taxes_minor_units: PAPER_DUTIES_MINOR_UNITS,
            },
        };

        shipments.insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn get_rate(&self, _request: &RateRequest) -> Result<RateResult, CarrierError> {
        Ok(RateResult {
            total_charges_minor_units: PAPER_TRANSPORTATION_MINOR_UNITS,
            currency_code: "USD".to_string(),
        })
    }

    async fn shop_rates(&self, request: &ShopRatesRequest) -> Result<Vec<RateQuote>, CarrierError> {
        let _ = request;
        Ok(vec![
            RateQuote {
                service_code: "GROUND".to_string(),
                total_charges_minor_units: PAPER_TRANSPORTATION_MINOR_UNITS,
                currency_code: "USD".to_string(),
            },
            RateQuote {
                service_code: "EXPRESS".to_string(),
                total_charges_minor_units: PAPER_TRANSPORTATION_MINOR_UNITS * 3,
                currency_code: "USD".to_string(),
            },
        ])
    }

    async fn validate_address(
        &self,
        address: &AddressToValidate,
    ) -> Result<AddressValidationResult, CarrierError> {
        if address.postal_code.is_empty() || address.country_code.is_empty() {
            return Ok(AddressValidationResult {
                status: AddressValidationStatus::Invalid,
                candidates: Vec::new(),
            });
        }
        Ok(AddressValidationResult {
            status: AddressValidationStatus::Valid,
            candidates: vec![AddressCandidate {
                address_lines: vec![address.address_line1.clone()],
                city: address.city.clone(),
                state_province_code: address.state_province_code.clone(),
                postal_code: address.postal_code.clone(),
            }],
        })
    }

    async fn void_shipment(&self, shipment_id: &str) -> Result<(), CarrierError> {
        let mut shipments = self.shipments.lock().expect("paper carrier mutex poisoned");
        shipments.retain(|_, v| v.shipment_id != shipment_id);
        Ok(())
    }

    async fn find_shipment_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ShipmentResult>, CarrierError> {
        let shipments = self.shipments.lock().expect("paper carrier mutex poisoned");
        Ok(shipments.get(idempotency_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipctl_schemas::Address;

    fn sample_request() -> ShipmentRequest {
        ShipmentRequest {
            shipper_snapshot_json: serde_json::json!({}),
            destination: Address {
                country_code: "US".to_string(),
                ..Default::default()
            },
            weight_oz: 16,
            length_in: 6,
            width_in: 6,
            height_in: 6,
            service_code: "GROUND".to_string(),
            hs_code: None,
            declared_value_minor_units: 1000,
            reference: "order-1".to_string(),
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_by_key() {
        let carrier = PaperCarrier::new();
        let req = sample_request();
        let first = carrier.create_shipment(&req, "key-1").await.unwrap();
        let second = carrier.create_shipment(&req, "key-1").await.unwrap();
        assert_eq!(first.tracking_numbers, second.tracking_numbers);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_tracking() {
        let carrier = PaperCarrier::new();
        let req = sample_request();
        let first = carrier.create_shipment(&req, "key-1").await.unwrap();
        let second = carrier.create_shipment(&req, "key-2").await.unwrap();
        assert_ne!(first.tracking_numbers, second.tracking_numbers);
    }

    #[tokio::test]
    async fn missing_country_code_fails_fast() {
        let carrier = PaperCarrier::new();
        let mut req = sample_request();
        req.destination.country_code.clear();
        let err = carrier.create_shipment(&req, "key-3").await.unwrap_err();
        assert_eq!(err.code, "E-3003");
    }
}
