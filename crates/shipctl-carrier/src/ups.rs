use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use shipctl_config::secrets::CarrierCredentials;
use shipctl_schemas::{
    AddressCandidate, AddressValidationResult, AddressValidationStatus, RateQuote, RateResult,
    ShipmentResult,
};

use crate::error::{translate_carrier_error, CarrierError};
use crate::normalize::{
    extract_carrier_error, normalize_rate_response, normalize_shipment_response,
    normalize_shop_rates_response,
};
use crate::{AddressToValidate, CarrierAdapter, RateRequest, ShipmentRequest, ShopRatesRequest};

const MAX_TRANSPORT_RETRIES: u32 = 3;
const TOKEN_REFRESH_SKEW: Duration = Duration::seconds(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Live carrier adapter: OAuth2 client-credentials exchange with token
/// caching and proactive refresh, idempotency-key header propagation,
/// bounded-jitter retry on transport failures only (§4.3).
pub struct UpsCarrier {
    http: reqwest::Client,
    credentials: CarrierCredentials,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl UpsCarrier {
    pub fn new(credentials: CarrierCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// Drops the cached token so the next `access_token()` call forces a
    /// fresh OAuth2 exchange (§7 E-5002: "stale token, C2 refreshes").
    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }

    async fn access_token(&self) -> Result<String, CarrierError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - TOKEN_REFRESH_SKEW > Utc::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let url = format!("{}/security/v1/oauth/token", self.credentials.base_url);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CarrierError::service_unavailable(format!("token request failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CarrierError::auth_failed("carrier rejected client credentials"));
        }
        if !resp.status().is_success() {
            return Err(CarrierError::service_unavailable(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CarrierError::unknown(format!("malformed token response: {e}")))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| CarrierError::unknown("token response missing access_token"))?
            .to_string();
        let expires_in: i64 = body["expires_in"].as_str().and_then(|s| s.parse().ok()).unwrap_or(3600);

        let cached = CachedToken {
            access_token: access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        };
        *guard = Some(cached);
        Ok(access_token)
    }

    /// POST with bounded-jitter retry on transport failures only; carrier
    /// validation errors (4xx with a recognizable error body) are never
    /// retried (§4.3).
    async fn post_json(&self, path: &str, body: &Value, idempotency_key: Option<&str>) -> Result<Value, CarrierError> {
        let mut token = self.access_token().await?;
        let url = format!("{}{}", self.credentials.base_url, path);

        let mut attempt = 0u32;
        let mut token_refreshed = false;
        loop {
            let mut req = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(body);
            if let Some(key) = idempotency_key {
                req = req.header("X-Idempotency-Key", key);
            }

            let send_result = req.send().await;
            let resp = match send_result {
                Ok(resp) => resp,
                Err(e) if attempt < MAX_TRANSPORT_RETRIES => {
                    attempt += 1;
                    sleep_with_jitter(attempt).await;
                    tracing::warn!(attempt, error = %e, "carrier transport error, retrying");
                    continue;
                }
                Err(e) => return Err(CarrierError::service_unavailable(format!("transport error: {e}"))),
            };

            let status = resp.status();
            if status.is_server_error() && attempt < MAX_TRANSPORT_RETRIES {
                attempt += 1;
                sleep_with_jitter(attempt).await;
                tracing::warn!(attempt, %status, "carrier 5xx, retrying");
                continue;
            }

            // §7 E-5002: a stale token is transparently refreshed and the
            // call retried once, never surfaced as a row-level failure.
            if status == reqwest::StatusCode::UNAUTHORIZED && !token_refreshed {
                token_refreshed = true;
                tracing::warn!("carrier rejected token as expired, refreshing and retrying once");
                self.clear_token().await;
                token = self.access_token().await?;
                continue;
            }

            let json_body: Value = resp
                .json()
                .await
                .map_err(|e| CarrierError::unknown(format!("malformed carrier response: {e}")))?;

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(CarrierError::token_expired("carrier token expired mid-request"));
            }
            if !status.is_success() {
                let (code, message) = extract_carrier_error(&json_body);
                return Err(translate_carrier_error(code.as_deref(), message.as_deref()));
            }

            return Ok(json_body);
        }
    }
}

async fn sleep_with_jitter(attempt: u32) {
    let base_ms = 100u64 * (1 << attempt.min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
}

fn shipment_request_body(request: &ShipmentRequest) -> Value {
    json!({
        "ShipmentRequest": {
            "Shipment": {
                "Shipper": request.shipper_snapshot_json,
                "ShipTo": {
                    "Name": request.destination.name,
                    "Address": {
                        "AddressLine": [request.destination.address_line1, request.destination.address_line2],
                        "City": request.destination.city,
                        "StateProvinceCode": request.destination.state_province_code,
                        "PostalCode": request.destination.postal_code,
                        "CountryCode": request.destination.country_code,
                    },
                    "Phone": {"Number": request.destination.phone},
                },
                "Service": {"Code": request.service_code},
                "Package": {
                    "PackageWeight": {"Weight": request.weight_oz},
                    "Dimensions": {
                        "Length": request.length_in,
                        "Width": request.width_in,
                        "Height": request.height_in,
                    },
                },
                "InvoiceLineTotal": {"MonetaryValue": request.declared_value_minor_units},
                "ReferenceNumber": {"Value": request.reference},
                "HSCode": request.hs_code,
            }
        }
    })
}

#[async_trait]
impl CarrierAdapter for UpsCarrier {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
        idempotency_key: &str,
    ) -> Result<ShipmentResult, CarrierError> {
        let body = shipment_request_body(request);
        let raw = self
            .post_json("/api/shipments/v1/ship", &body, Some(idempotency_key))
            .await?;
        Ok(normalize_shipment_response(&raw))
    }

    async fn get_rate(&self, request: &RateRequest) -> Result<RateResult, CarrierError> {
        let body = json!({
            "RateRequest": {
                "Shipment": {
                    "Shipper": request.shipper_snapshot_json,
                    "ShipTo": {"Address": {
                        "City": request.destination.city,
                        "StateProvinceCode": request.destination.state_province_code,
                        "PostalCode": request.destination.postal_code,
                        "CountryCode": request.destination.country_code,
                    }},
                    "Service": {"Code": request.service_code},
                    "Package": {"PackageWeight": {"Weight": request.weight_oz}},
                }
            }
        });
        let raw = self.post_json("/api/rating/v1/Rate", &body, None).await?;
        Ok(normalize_rate_response(&raw))
    }

    async fn shop_rates(&self, request: &ShopRatesRequest) -> Result<Vec<RateQuote>, CarrierError> {
        let body = json!({
            "RateRequest": {
                "Shipment": {
                    "Shipper": request.shipper_snapshot_json,
                    "ShipTo": {"Address": {
                        "City": request.destination.city,
                        "StateProvinceCode": request.destination.state_province_code,
                        "PostalCode": request.destination.postal_code,
                        "CountryCode": request.destination.country_code,
                    }},
                    "Package": {"PackageWeight": {"Weight": request.weight_oz}},
                }
            }
        });
        let raw = self.post_json("/api/rating/v1/Shop", &body, None).await?;
        Ok(normalize_shop_rates_response(&raw))
    }

    async fn validate_address(
        &self,
        address: &AddressToValidate,
    ) -> Result<AddressValidationResult, CarrierError> {
        let body = json!({
            "XAVRequest": {
                "AddressKeyFormat": {
                    "AddressLine": [address.address_line1, address.address_line2],
                    "PoliticalDivision2": address.city,
                    "PoliticalDivision1": address.state_province_code,
                    "PostcodePrimaryLow": address.postal_code,
                    "CountryCode": address.country_code,
                }
            }
        });
        let raw = self.post_json("/api/addressvalidation/v1/1", &body, None).await?;
        Ok(normalize_address_response(&raw))
    }

    async fn void_shipment(&self, shipment_id: &str) -> Result<(), CarrierError> {
        let body = json!({"VoidShipmentRequest": {"ShipmentIdentificationNumber": shipment_id}});
        let raw = self.post_json("/api/shipments/v1/void", &body, None).await?;
        let status = &raw["VoidShipmentResponse"]["SummaryResult"]["Status"];
        if status["Code"].as_str() == Some("1") {
            Ok(())
        } else {
            Err(CarrierError::unknown(format!(
                "void failed: {}",
                status["Description"].as_str().unwrap_or("unknown reason")
            )))
        }
    }

    async fn find_shipment_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ShipmentResult>, CarrierError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/api/shipments/v1/lookup?idempotencyKey={}",
            self.credentials.base_url, idempotency_key
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| CarrierError::service_unavailable(format!("lookup transport error: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(CarrierError::service_unavailable(format!(
                "lookup returned {}",
                resp.status()
            )));
        }
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| CarrierError::unknown(format!("malformed lookup response: {e}")))?;
        Ok(Some(normalize_shipment_response(&raw)))
    }
}

fn normalize_address_response(raw: &Value) -> AddressValidationResult {
    let xav = &raw["XAVResponse"];
    let status = if xav.get("ValidAddressIndicator").is_some() {
        AddressValidationStatus::Valid
    } else if xav.get("AmbiguousAddressIndicator").is_some() {
        AddressValidationStatus::Ambiguous
    } else if xav.get("NoCandidatesIndicator").is_some() {
        AddressValidationStatus::Invalid
    } else {
        AddressValidationStatus::Unknown
    };

    let candidate_data = match &xav["Candidate"] {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };

    let candidates = candidate_data
        .iter()
        .map(|c| {
            let akf = &c["AddressKeyFormat"];
            AddressCandidate {
                address_lines: akf["AddressLine"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
                city: akf["PoliticalDivision2"].as_str().unwrap_or("").to_string(),
                state_province_code: akf["PoliticalDivision1"].as_str().unwrap_or("").to_string(),
                postal_code: akf["PostcodePrimaryLow"].as_str().unwrap_or("").to_string(),
            }
        })
        .collect();

    AddressValidationResult { status, candidates }
}
