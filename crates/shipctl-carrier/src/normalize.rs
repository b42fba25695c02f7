//! Response normalization for the UPS adapter (§4.3). The carrier's JSON
//! nests a `PackageResults`/`RatedShipment` structure that is a bare object
//! for a single package and an array for multiple; everything here folds
//! both shapes into the same typed result.

use serde_json::Value;

use shipctl_schemas::{ChargeBreakdown, RateQuote, RateResult, ShipmentResult};

/// Normalize a dict-or-list JSON field into a `Vec<Value>`.
fn as_list(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Carrier charges are always non-negative decimal strings like "12.5".
fn decimal_to_minor_units(s: &str) -> i64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    match s.split_once('.') {
        Some((whole, frac)) => {
            let whole: i64 = whole.parse().unwrap_or(0);
            let mut frac = frac.to_string();
            frac.truncate(2);
            while frac.len() < 2 {
                frac.push('0');
            }
            let frac: i64 = frac.parse().unwrap_or(0);
            whole * 100 + frac
        }
        None => s.parse::<i64>().unwrap_or(0) * 100,
    }
}

/// Prefer `NegotiatedRateCharges.TotalCharge` over the published
/// `ShipmentCharges.TotalCharges` / bare `TotalCharges` whenever the
/// negotiated figure is present and non-empty (§4.3).
fn preferred_charge<'a>(negotiated: &'a Value, published: &'a Value) -> &'a Value {
    let negotiated_value = negotiated.get("MonetaryValue").and_then(Value::as_str);
    match negotiated_value {
        Some(v) if !v.is_empty() => negotiated,
        _ => published,
    }
}

pub fn normalize_shipment_response(raw: &Value) -> ShipmentResult {
    let results = &raw["ShipmentResponse"]["ShipmentResults"];
    let shipment_id = results["ShipmentIdentificationNumber"]
        .as_str()
        .unwrap_or("")
        .to_string();

    let pkg_results = as_list(&results["PackageResults"]);
    let tracking_numbers: Vec<String> = pkg_results
        .iter()
        .map(|p| p["TrackingNumber"].as_str().unwrap_or("").to_string())
        .collect();
    let label_data: Vec<String> = pkg_results
        .iter()
        .map(|p| {
            p["ShippingLabel"]["GraphicImage"]
                .as_str()
                .unwrap_or("")
                .to_string()
        })
        .collect();

    let negotiated = &results["NegotiatedRateCharges"]["TotalCharge"];
    let published = &results["ShipmentCharges"]["TotalCharges"];
    let charge = preferred_charge(negotiated, published);

    let total_minor = decimal_to_minor_units(charge["MonetaryValue"].as_str().unwrap_or("0"));
    let currency = charge["CurrencyCode"].as_str().unwrap_or("USD").to_string();

    let duties_minor = decimal_to_minor_units(
        results["ShipmentCharges"]["TaxesAndFees"]["MonetaryValue"]
            .as_str()
            .unwrap_or("0"),
    );

    ShipmentResult {
        tracking_numbers,
        label_data,
        shipment_id,
        total_charges_minor_units: total_minor,
        currency_code: currency,
        breakdown: ChargeBreakdown {
            transportation_minor_units: total_minor - duties_minor,
            duties_taxes_minor_units: duties_minor,
        },
    }
}

pub fn normalize_rate_response(raw: &Value) -> RateResult {
    let rated = as_list(&raw["RateResponse"]["RatedShipment"]);
    let first = rated.first().cloned().unwrap_or(Value::Null);

    let negotiated = &first["NegotiatedRateCharges"]["TotalCharge"];
    let published = &first["TotalCharges"];
    let charge = preferred_charge(negotiated, published);

    RateResult {
        total_charges_minor_units: decimal_to_minor_units(
            charge["MonetaryValue"].as_str().unwrap_or("0"),
        ),
        currency_code: charge["CurrencyCode"].as_str().unwrap_or("USD").to_string(),
    }
}

pub fn normalize_shop_rates_response(raw: &Value) -> Vec<RateQuote> {
    let rated = as_list(&raw["RateResponse"]["RatedShipment"]);
    rated
        .iter()
        .map(|r| {
            let charges = &r["TotalCharges"];
            RateQuote {
                service_code: r["Service"]["Code"].as_str().unwrap_or("").to_string(),
                total_charges_minor_units: decimal_to_minor_units(
                    charges["MonetaryValue"].as_str().unwrap_or("0"),
                ),
                currency_code: charges["CurrencyCode"].as_str().unwrap_or("USD").to_string(),
            }
        })
        .collect()
}

/// Extract `(code, message)` from the carrier's error payload, which may be
/// double-nested: an outer error wrapping `response.errors[0]` (§4.3). Never
/// discards the raw message text even when no code is recognizable.
pub fn extract_carrier_error(raw: &Value) -> (Option<String>, Option<String>) {
    if let Some(errors) = raw.get("errors").and_then(Value::as_array) {
        if let Some(first) = errors.first() {
            return (
                first["code"].as_str().map(str::to_string),
                first["message"].as_str().map(str::to_string),
            );
        }
    }
    if let Some(inner) = raw.get("response") {
        if let Some(errors) = inner.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                return (
                    first["code"].as_str().map(str::to_string),
                    first["message"].as_str().map(str::to_string),
                );
            }
        }
    }
    (
        raw["code"].as_str().map(str::to_string),
        raw["message"].as_str().map(str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_package_dict_normalizes_like_a_list() {
        let raw = json!({
            "ShipmentResponse": {
                "ShipmentResults": {
                    "ShipmentIdentificationNumber": "1Z999",
                    "PackageResults": {"TrackingNumber": "1Z9991", "ShippingLabel": {"GraphicImage": "base64=="}},
                    "ShipmentCharges": {"TotalCharges": {"MonetaryValue": "12.50", "CurrencyCode": "USD"}},
                }
            }
        });
        let result = normalize_shipment_response(&raw);
        assert_eq!(result.tracking_numbers, vec!["1Z9991".to_string()]);
        assert_eq!(result.total_charges_minor_units, 1250);
    }

    #[test]
    fn negotiated_charge_wins_when_present() {
        let raw = json!({
            "ShipmentResponse": {
                "ShipmentResults": {
                    "ShipmentIdentificationNumber": "1Z999",
                    "PackageResults": [{"TrackingNumber": "1Z1"}],
                    "NegotiatedRateCharges": {"TotalCharge": {"MonetaryValue": "9.99", "CurrencyCode": "USD"}},
                    "ShipmentCharges": {"TotalCharges": {"MonetaryValue": "15.00", "CurrencyCode": "USD"}},
                }
            }
        });
        let result = normalize_shipment_response(&raw);
        assert_eq!(result.total_charges_minor_units, 999);
    }

    #[test]
    fn nested_response_errors_are_extracted() {
        let raw = json!({"response": {"errors": [{"code": "111030", "message": "no service"}]}});
        let (code, message) = extract_carrier_error(&raw);
        assert_eq!(code.as_deref(), Some("111030"));
        assert_eq!(message.as_deref(), Some("no service"));
    }
}
