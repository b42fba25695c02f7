use std::fmt;

/// Stable, machine-readable carrier error (§7 E-3xxx/E-5xxx). Hand-rolled
/// rather than derived: the taxonomy is a closed, spec-defined set, not an
/// open error hierarchy.
#[derive(Debug, Clone)]
pub struct CarrierError {
    pub code: &'static str,
    pub message: String,
}

impl CarrierError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("E-3001", message)
    }

    pub fn rate_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new("E-3002", message)
    }

    pub fn address_validation_failed(message: impl Into<String>) -> Self {
        Self::new("E-3003", message)
    }

    pub fn service_not_available(message: impl Into<String>) -> Self {
        Self::new("E-3004", message)
    }

    pub fn customs_validation(message: impl Into<String>) -> Self {
        Self::new("E-3005", message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new("E-3006", message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new("E-1001", format!("missing required field: {field}"))
    }

    pub fn structural_fields_required(message: impl Into<String>) -> Self {
        Self::new("E-2015", message)
    }

    pub fn international_missing_field(field: &str) -> Self {
        Self::new("E-2013", format!("international shipment missing required field: {field}"))
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new("E-5001", message)
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new("E-5002", message)
    }

    /// Transport-layer failures (connection reset, timeout, 5xx) are the
    /// only class C2 retries internally (§4.3); everything else is
    /// terminal for the calling row.
    pub fn is_retryable_transport(&self) -> bool {
        self.code == "E-3001"
    }
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CarrierError {}

/// UPS numeric error codes mapped to the stable taxonomy (§4.3, §7).
/// Anything unrecognized falls through to a pattern match on the message
/// text, then to E-3006.
const UPS_CODE_MAP: &[(&str, &str)] = &[
    ("120100", "E-3003"),
    ("120101", "E-3003"),
    ("120102", "E-3003"),
    ("120104", "E-3003"),
    ("111030", "E-3004"),
    ("111050", "E-3004"),
    ("111057", "E-3004"),
    ("111210", "E-3004"),
    ("250001", "E-5001"),
    ("250002", "E-5001"),
    ("250003", "E-5002"),
    ("190001", "E-3001"),
    ("190002", "E-3001"),
    ("190100", "E-3002"),
];

const UPS_MESSAGE_PATTERNS: &[(&str, &str)] = &[
    ("address not found", "E-3003"),
    ("service unavailable", "E-3001"),
    ("rate limit", "E-3002"),
    ("unauthorized", "E-5001"),
    ("token expired", "E-5002"),
];

/// Translate a raw carrier error code + message into a `CarrierError`
/// carrying the stable E-code (§4.3 Error translation).
pub fn translate_carrier_error(code: Option<&str>, message: Option<&str>) -> CarrierError {
    if let Some(code) = code {
        if let Some((_, sa_code)) = UPS_CODE_MAP.iter().find(|(c, _)| *c == code) {
            return CarrierError::new(sa_code, message.unwrap_or("carrier error").to_string());
        }
    }

    if let Some(message) = message {
        let lower = message.to_lowercase();
        for (pattern, sa_code) in UPS_MESSAGE_PATTERNS {
            if lower.contains(pattern) {
                return CarrierError::new(sa_code, message.to_string());
            }
        }
    }

    CarrierError::unknown(message.unwrap_or("unrecognized carrier error").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_maps_directly() {
        let err = translate_carrier_error(Some("111030"), Some("no service"));
        assert_eq!(err.code, "E-3004");
    }

    #[test]
    fn unknown_code_falls_back_to_message_pattern() {
        let err = translate_carrier_error(Some("999999"), Some("Rate limit exceeded, retry later"));
        assert_eq!(err.code, "E-3002");
    }

    #[test]
    fn nothing_recognizable_falls_back_to_unknown() {
        let err = translate_carrier_error(None, Some("bizarre carrier hiccup"));
        assert_eq!(err.code, "E-3006");
        assert!(err.message.contains("bizarre"));
    }
}
