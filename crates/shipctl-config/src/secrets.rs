//! Redacted secret resolution, mirroring the redacting-`Debug` pattern used
//! elsewhere in this codebase for anything that must never land in a log
//! line or an audit event's detail blob verbatim (§6.3).

use std::fmt;

use anyhow::{Context, Result};

use crate::RunMode;

/// OAuth2 client-credentials + account identity for the carrier (§4.3).
#[derive(Clone)]
pub struct CarrierCredentials {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub account_number: String,
}

impl fmt::Debug for CarrierCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierCredentials")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<REDACTED>")
            .field("account_number", &"<REDACTED>")
            .finish()
    }
}

/// Environment-provided shipper fallback address (§4.1 precedence step 4).
#[derive(Debug, Clone, Default)]
pub struct ShipperFallback {
    pub name: String,
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state_province_code: String,
    pub postal_code: String,
    pub country_code: String,
    pub phone: String,
}

/// All secrets this process may need, resolved once and passed down by
/// reference. In `paper` mode carrier credentials are optional since the
/// carrier client never leaves the process.
pub struct ResolvedSecrets {
    pub mode: RunMode,
    pub carrier: Option<CarrierCredentials>,
    pub shipper_fallback: ShipperFallback,
}

impl fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("mode", &self.mode)
            .field("carrier", &self.carrier)
            .field("shipper_fallback", &self.shipper_fallback)
            .finish()
    }
}

impl fmt::Debug for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Paper => write!(f, "Paper"),
            RunMode::Live => write!(f, "Live"),
        }
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} not set"))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolve secrets for the given mode. In `Live` mode, missing carrier
/// credentials fail fast (§6.3); in `Paper` mode they're simply absent.
pub fn resolve_secrets_for_mode(mode: RunMode) -> Result<ResolvedSecrets> {
    let carrier = match mode {
        RunMode::Live => Some(CarrierCredentials {
            base_url: env_var("SHIPCTL_CARRIER_BASE_URL")?,
            client_id: env_var("SHIPCTL_CARRIER_CLIENT_ID")?,
            client_secret: env_var("SHIPCTL_CARRIER_CLIENT_SECRET")?,
            account_number: env_var("SHIPCTL_CARRIER_ACCOUNT_NUMBER")?,
        }),
        RunMode::Paper => {
            let base_url = env_var_opt("SHIPCTL_CARRIER_BASE_URL");
            let client_id = env_var_opt("SHIPCTL_CARRIER_CLIENT_ID");
            let client_secret = env_var_opt("SHIPCTL_CARRIER_CLIENT_SECRET");
            let account_number = env_var_opt("SHIPCTL_CARRIER_ACCOUNT_NUMBER");
            match (base_url, client_id, client_secret, account_number) {
                (Some(base_url), Some(client_id), Some(client_secret), Some(account_number)) => {
                    Some(CarrierCredentials {
                        base_url,
                        client_id,
                        client_secret,
                        account_number,
                    })
                }
                _ => None,
            }
        }
    };

    let shipper_fallback = ShipperFallback {
        name: env_var_opt("SHIPCTL_SHIPPER_NAME").unwrap_or_default(),
        address_line1: env_var_opt("SHIPCTL_SHIPPER_ADDRESS_LINE1").unwrap_or_default(),
        address_line2: env_var_opt("SHIPCTL_SHIPPER_ADDRESS_LINE2").unwrap_or_default(),
        city: env_var_opt("SHIPCTL_SHIPPER_CITY").unwrap_or_default(),
        state_province_code: env_var_opt("SHIPCTL_SHIPPER_STATE").unwrap_or_default(),
        postal_code: env_var_opt("SHIPCTL_SHIPPER_POSTAL_CODE").unwrap_or_default(),
        country_code: env_var_opt("SHIPCTL_SHIPPER_COUNTRY").unwrap_or_default(),
        phone: env_var_opt("SHIPCTL_SHIPPER_PHONE").unwrap_or_default(),
    };

    Ok(ResolvedSecrets {
        mode,
        carrier,
        shipper_fallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_carrier_secret() {
        let creds = CarrierCredentials {
            base_url: "https://carrier.example".to_string(),
            client_id: "id-123".to_string(),
            client_secret: "super-secret".to_string(),
            account_number: "ACC-1".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("ACC-1"));
        assert!(rendered.contains("id-123"));
    }
}
