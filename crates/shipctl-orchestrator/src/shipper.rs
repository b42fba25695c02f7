//! Shipper address resolution (§4.1 precedence chain). Deterministic,
//! first-match-wins; failure at any step falls through to the next rather
//! than erroring immediately.

use shipctl_schemas::Address;

use crate::RemoteShopConnector;

/// Step 1: a job's own persisted shipper snapshot, set during the preview
/// flow (before confirmation). Present on any job an operator has already
/// reviewed and is now re-confirming.
fn from_job_snapshot(snapshot: Option<&serde_json::Value>) -> Option<Address> {
    snapshot.and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Step 2: the environment-provided fallback, but only while a local file
/// source (delimited or spreadsheet) is the active data source — a
/// database or records source carries no notion of "the operator's own
/// shipping desk" the way a local file import does.
fn from_env_with_local_source(
    fallback: &shipctl_config::ShipperFallback,
    active_source_is_local_file: bool,
) -> Option<Address> {
    if !active_source_is_local_file || fallback.name.is_empty() {
        return None;
    }
    Some(fallback_to_address(fallback))
}

/// Step 3: a remote e-commerce platform's configured shop address. This
/// repo carries the connector trait so the chain has somewhere to plug in,
/// but ships no concrete connector — in practice this link is always a
/// fall-through until one is registered.
fn from_remote_shop(connector: Option<&dyn RemoteShopConnector>) -> Option<Address> {
    connector.and_then(|c| c.shop_address())
}

/// Step 4: final fallback, regardless of active source kind.
fn from_env_fallback(fallback: &shipctl_config::ShipperFallback) -> Option<Address> {
    if fallback.name.is_empty() {
        None
    } else {
        Some(fallback_to_address(fallback))
    }
}

fn fallback_to_address(f: &shipctl_config::ShipperFallback) -> Address {
    Address {
        name: f.name.clone(),
        address_line1: f.address_line1.clone(),
        address_line2: f.address_line2.clone(),
        city: f.city.clone(),
        state_province_code: f.state_province_code.clone(),
        postal_code: f.postal_code.clone(),
        country_code: f.country_code.clone(),
        phone: f.phone.clone(),
    }
}

#[derive(Debug)]
pub struct NoShipperResolved;

impl std::fmt::Display for NoShipperResolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no shipper address could be resolved through any precedence step")
    }
}

impl std::error::Error for NoShipperResolved {}

/// Runs the four-step precedence chain (§4.1). Returns the first address
/// found; each step's failure is silent fall-through, never an error —
/// only exhausting every step is an error.
pub fn resolve_shipper(
    job_shipper_snapshot: Option<&serde_json::Value>,
    fallback: &shipctl_config::ShipperFallback,
    active_source_is_local_file: bool,
    remote_shop: Option<&dyn RemoteShopConnector>,
) -> Result<Address, NoShipperResolved> {
    from_job_snapshot(job_shipper_snapshot)
        .or_else(|| from_env_with_local_source(fallback, active_source_is_local_file))
        .or_else(|| from_remote_shop(remote_shop))
        .or_else(|| from_env_fallback(fallback))
        .ok_or(NoShipperResolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipctl_config::ShipperFallback;

    fn fallback() -> ShipperFallback {
        ShipperFallback {
            name: "Acme Fulfillment".into(),
            address_line1: "1 Warehouse Way".into(),
            address_line2: String::new(),
            city: "Columbus".into(),
            state_province_code: "OH".into(),
            postal_code: "43215".into(),
            country_code: "US".into(),
            phone: "6145551234".into(),
        }
    }

    #[test]
    fn job_snapshot_wins_over_everything() {
        let snapshot = serde_json::to_value(Address {
            name: "Preview Shipper".into(),
            ..Default::default()
        })
        .unwrap();
        let resolved = resolve_shipper(Some(&snapshot), &fallback(), true, None).unwrap();
        assert_eq!(resolved.name, "Preview Shipper");
    }

    #[test]
    fn env_fallback_only_applies_with_local_file_source() {
        let resolved = resolve_shipper(None, &fallback(), false, None);
        // step 2 skipped (not a local file source), step 3 has no connector,
        // step 4 (unconditional fallback) still applies.
        assert_eq!(resolved.unwrap().name, "Acme Fulfillment");
    }

    #[test]
    fn no_shipper_resolved_when_chain_is_fully_empty() {
        let empty = ShipperFallback::default();
        let err = resolve_shipper(None, &empty, false, None);
        assert!(err.is_err());
    }
}
