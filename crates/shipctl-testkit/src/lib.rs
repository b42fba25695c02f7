//! Shared fixtures for scenario tests across crates: a deterministic
//! order-snapshot builder, a temp CSV source builder for shipctl-gateway,
//! and a migrated test pool helper. Mirrors the role the teacher's own
//! testkit crate plays for its scenario tests.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use shipctl_schemas::{Address, OrderSnapshot};

pub use shipctl_carrier::PaperCarrier;

/// A row checksum stable over the fields the engine treats as the row's
/// identity, independent of column order in the source file.
pub fn row_checksum(snapshot: &OrderSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.reference.as_bytes());
    hasher.update(snapshot.destination.postal_code.as_bytes());
    hasher.update(snapshot.weight_oz.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// A minimal, valid domestic order snapshot for scenario tests, with the
/// reference number varied by caller so rows don't collide.
pub fn sample_order_snapshot(reference: &str) -> OrderSnapshot {
    OrderSnapshot {
        destination: Address {
            name: "Jane Tester".to_string(),
            address_line1: "500 Test Ave".to_string(),
            address_line2: String::new(),
            city: "Columbus".to_string(),
            state_province_code: "OH".to_string(),
            postal_code: "43215".to_string(),
            country_code: "US".to_string(),
            phone: "6145550000".to_string(),
        },
        weight_oz: 16,
        length_in: 8,
        width_in: 6,
        height_in: 4,
        service_code: "GROUND".to_string(),
        hs_code: None,
        declared_value_minor_units: 2500,
        reference: reference.to_string(),
    }
}

/// Builds a `NewJob` plus its `NewJobRow`s from a list of order snapshots,
/// computing each row's checksum and its idempotency key up front the same
/// way the gateway's import path would (§4.2.1 step 1, restart_epoch 0).
pub fn build_job_fixture(
    name: &str,
    snapshots: Vec<OrderSnapshot>,
    write_back_enabled: bool,
) -> (shipctl_db::NewJob, Vec<shipctl_db::NewJobRow>) {
    let job_id = Uuid::new_v4();
    let rows = snapshots
        .into_iter()
        .enumerate()
        .map(|(i, snapshot)| {
            let row_number = (i + 1) as i64;
            let checksum = row_checksum(&snapshot);
            let idempotency_key = shipctl_engine::idempotency_key(job_id, row_number, &checksum, 0);
            shipctl_db::NewJobRow {
                row_number,
                content_checksum: checksum,
                order_snapshot: snapshot,
                idempotency_key,
            }
        })
        .collect();

    let new_job = shipctl_db::NewJob {
        id: job_id,
        name: name.to_string(),
        command_text: format!("test fixture: {name}"),
        mode: shipctl_schemas::JobMode::Confirm,
        write_back_enabled,
    };

    (new_job, rows)
}

/// Writes a small delimited source file to a temp directory and imports it
/// through the gateway, returning the gateway and the backing tempdir (kept
/// alive for the caller so the file isn't deleted mid-test).
pub fn temp_csv_source(
    rows: &[(&str, &str, &str, &str)], // (reference, city, state, postal_code)
) -> Result<(shipctl_gateway::DataGateway, tempfile::TempDir)> {
    let dir = tempfile::tempdir().context("create temp dir")?;
    let path = dir.path().join("orders.csv");

    let mut writer = csv::Writer::from_path(&path).context("open csv for write")?;
    writer.write_record(["reference", "city", "state", "postal_code"])?;
    for (reference, city, state, postal_code) in rows {
        writer.write_record([*reference, *city, *state, *postal_code])?;
    }
    writer.flush()?;

    let gateway = shipctl_gateway::DataGateway::new();
    gateway
        .import_delimited(path.to_str().context("non-utf8 temp path")?, b',', true)
        .context("import temp csv fixture")?;

    Ok((gateway, dir))
}

/// Connects to `DATABASE_URL` and runs migrations, for integration tests
/// that need a real Postgres instance. Scenario tests gate on this rather
/// than mocking the store, matching the rest of this codebase's stance on
/// hitting a real database in integration tests.
pub async fn migrated_test_pool() -> Result<PgPool> {
    let pool = shipctl_db::connect_from_env().await?;
    shipctl_db::migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_checksum_is_stable_for_identical_snapshots() {
        let a = sample_order_snapshot("ORD-1");
        let b = sample_order_snapshot("ORD-1");
        assert_eq!(row_checksum(&a), row_checksum(&b));
    }

    #[test]
    fn build_job_fixture_assigns_sequential_row_numbers() {
        let snapshots = vec![sample_order_snapshot("ORD-1"), sample_order_snapshot("ORD-2")];
        let (_job, rows) = build_job_fixture("two rows", snapshots, true);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[1].row_number, 2);
        assert_ne!(rows[0].idempotency_key, rows[1].idempotency_key);
    }
}
