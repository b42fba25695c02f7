//! Data Gateway (C3, §4.4). One active source at a time, process-global
//! singleton; every row carries a 1-based source row number and a content
//! checksum so the engine's idempotency key and the store's `job_rows` row
//! stay anchored to the exact input that produced them.

mod atomic;
mod delimited;
mod spreadsheet;

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub use atomic::atomic_rewrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Delimited,
    Spreadsheet,
    Database,
    Records,
}

impl SourceKind {
    fn as_str(self) -> &'static str {
        match self {
            SourceKind::Delimited => "delimited",
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::Database => "database",
            SourceKind::Records => "records",
        }
    }
}

/// One row of the currently loaded source: ordered column values plus the
/// bookkeeping the rest of the system keys off.
#[derive(Debug, Clone)]
pub struct GatewayRow {
    pub row_number: i64,
    pub checksum: String,
    pub fields: BTreeMap<String, String>,
}

fn row_checksum(fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in fields {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(hasher.finalize())
}

fn source_signature(kind: SourceKind, reference: &str, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(reference.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(columns.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source_type: String,
    pub reference: String,
    pub row_count: i64,
    pub columns: Vec<String>,
    pub source_signature: String,
}

/// A loaded source's editability, which decides how `WriteBack*` applies
/// (§4.4 Atomicity): delimited/spreadsheet sources are rewritten in place;
/// editable database sources get one transaction of N UPDATEs against the
/// table they were imported from; everything else without a single
/// writable backing (records, EDI, read-only SQL) gets a companion CSV of
/// tracked shipments instead.
enum WriteTarget {
    DelimitedFile { path: String, delimiter: u8 },
    SpreadsheetFile { path: String, sheet: String },
    DirectUpdate { connection_string: String, table: String, key_column: String },
    CompanionCsv { path: String },
}

/// Identifies an editable database source for `ImportDatabase` (§4.4): the
/// table the rows came from and a column that uniquely keys each row, used
/// to target the `UPDATE` for that row at write-back time. Omit this when
/// importing a read-only view, a join across tables, or anything else with
/// no single updatable table behind it — those fall back to the companion
/// CSV path.
pub struct DatabaseWriteBack {
    pub table: String,
    pub key_column: String,
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct LoadedSource {
    kind: SourceKind,
    reference: String,
    columns: Vec<String>,
    rows: Vec<GatewayRow>,
    signature: String,
    write_target: WriteTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Contains,
}

#[derive(Debug, Clone)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

fn matches(row: &GatewayRow, clause: &FilterClause) -> bool {
    let Some(actual) = row.fields.get(&clause.column) else {
        return false;
    };
    match clause.op {
        FilterOp::Eq => actual == &clause.value,
        FilterOp::Neq => actual != &clause.value,
        FilterOp::Contains => actual.contains(&clause.value),
    }
}

pub struct RowsPage {
    pub rows: Vec<GatewayRow>,
    pub total_count: i64,
}

/// Process-global active data source (§4.4: "one active source at a time").
/// Construct one instance and share it (`Arc<DataGateway>`) across the
/// orchestrator and CLI.
#[derive(Default)]
pub struct DataGateway {
    active: Mutex<Option<LoadedSource>>,
}

impl DataGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import_delimited(&self, path: &str, delimiter: u8, header: bool) -> Result<SourceInfo> {
        let (columns, raw_rows) = delimited::read_delimited(path, delimiter, header)?;
        let rows = rows_from_raw(&columns, raw_rows);
        let signature = source_signature(SourceKind::Delimited, path, &columns);
        let info = SourceInfo {
            source_type: SourceKind::Delimited.as_str().to_string(),
            reference: path.to_string(),
            row_count: rows.len() as i64,
            columns: columns.clone(),
            source_signature: signature.clone(),
        };
        *self.active.lock().expect("gateway mutex poisoned") = Some(LoadedSource {
            kind: SourceKind::Delimited,
            reference: path.to_string(),
            columns,
            rows,
            signature,
            write_target: WriteTarget::DelimitedFile {
                path: path.to_string(),
                delimiter,
            },
        });
        Ok(info)
    }

    pub fn import_spreadsheet(&self, path: &str, sheet: &str) -> Result<SourceInfo> {
        let (columns, raw_rows) = spreadsheet::read_spreadsheet(path, sheet)?;
        let rows = rows_from_raw(&columns, raw_rows);
        let signature = source_signature(SourceKind::Spreadsheet, path, &columns);
        let info = SourceInfo {
            source_type: SourceKind::Spreadsheet.as_str().to_string(),
            reference: path.to_string(),
            row_count: rows.len() as i64,
            columns: columns.clone(),
            source_signature: signature.clone(),
        };
        *self.active.lock().expect("gateway mutex poisoned") = Some(LoadedSource {
            kind: SourceKind::Spreadsheet,
            reference: path.to_string(),
            columns,
            rows,
            signature,
            write_target: WriteTarget::SpreadsheetFile {
                path: path.to_string(),
                sheet: sheet.to_string(),
            },
        });
        Ok(info)
    }

    /// Imports the result set of `query` run against `connection_string`.
    /// When `write_back` names an editable table and key column, write-back
    /// targets that table directly with one transaction of N UPDATEs;
    /// otherwise (read-only SQL, a view, a join) write-back lands in a
    /// companion CSV beside a synthesized reference name (§4.4).
    pub async fn import_database(
        &self,
        connection_string: &str,
        query: &str,
        write_back: Option<DatabaseWriteBack>,
    ) -> Result<SourceInfo> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(connection_string)
            .await
            .context("connect to import database failed")?;
        let fetched = sqlx::query(query)
            .fetch_all(&pool)
            .await
            .context("import query failed")?;

        let columns: Vec<String> = fetched
            .first()
            .map(|row| {
                use sqlx::Column;
                row.columns().iter().map(|c| c.name().to_string()).collect()
            })
            .unwrap_or_default();

        let raw_rows: Vec<Vec<String>> = fetched
            .iter()
            .map(|row| {
                use sqlx::{Row, ValueRef};
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, _)| {
                        row.try_get_raw(idx)
                            .ok()
                            .and_then(|raw| {
                                if raw.is_null() {
                                    None
                                } else {
                                    row.try_get::<String, _>(idx).ok()
                                }
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();

        let rows = rows_from_raw(&columns, raw_rows);
        let reference = format!("database:{query}");
        let signature = source_signature(SourceKind::Database, &reference, &columns);

        let write_target = match write_back {
            Some(DatabaseWriteBack { table, key_column }) => {
                if !valid_identifier(&table) || !valid_identifier(&key_column) {
                    bail!("write-back table/key_column must be a plain identifier");
                }
                if !columns.iter().any(|c| c == &key_column) {
                    bail!("write-back key_column `{key_column}` is not present in the imported columns");
                }
                WriteTarget::DirectUpdate {
                    connection_string: connection_string.to_string(),
                    table,
                    key_column,
                }
            }
            None => {
                let companion_path = format!("{}.shipctl-write-back.csv", sha256_short(&reference));
                WriteTarget::CompanionCsv { path: companion_path }
            }
        };

        let info = SourceInfo {
            source_type: SourceKind::Database.as_str().to_string(),
            reference: reference.clone(),
            row_count: rows.len() as i64,
            columns: columns.clone(),
            source_signature: signature.clone(),
        };
        *self.active.lock().expect("gateway mutex poisoned") = Some(LoadedSource {
            kind: SourceKind::Database,
            reference,
            columns,
            rows,
            signature,
            write_target,
        });
        Ok(info)
    }

    pub fn import_records(&self, records: Vec<BTreeMap<String, String>>, label: &str) -> Result<SourceInfo> {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows: Vec<GatewayRow> = records
            .into_iter()
            .enumerate()
            .map(|(idx, fields)| GatewayRow {
                row_number: idx as i64 + 1,
                checksum: row_checksum(&fields),
                fields,
            })
            .collect();

        let reference = format!("records:{label}");
        let signature = source_signature(SourceKind::Records, &reference, &columns);
        let companion_path = format!("{}.shipctl-write-back.csv", sha256_short(&reference));
        let info = SourceInfo {
            source_type: SourceKind::Records.as_str().to_string(),
            reference: reference.clone(),
            row_count: rows.len() as i64,
            columns: columns.clone(),
            source_signature: signature.clone(),
        };
        *self.active.lock().expect("gateway mutex poisoned") = Some(LoadedSource {
            kind: SourceKind::Records,
            reference,
            columns,
            rows,
            signature,
            write_target: WriteTarget::CompanionCsv { path: companion_path },
        });
        Ok(info)
    }

    pub fn get_schema(&self) -> Result<Vec<String>> {
        let guard = self.active.lock().expect("gateway mutex poisoned");
        let source = guard.as_ref().context("no active data source")?;
        Ok(source.columns.clone())
    }

    pub fn get_source_info(&self) -> Result<SourceInfo> {
        let guard = self.active.lock().expect("gateway mutex poisoned");
        let source = guard.as_ref().context("no active data source")?;
        Ok(SourceInfo {
            source_type: source.kind.as_str().to_string(),
            reference: source.reference.clone(),
            row_count: source.rows.len() as i64,
            columns: source.columns.clone(),
            source_signature: source.signature.clone(),
        })
    }

    pub fn get_source_signature(&self) -> Result<String> {
        let guard = self.active.lock().expect("gateway mutex poisoned");
        let source = guard.as_ref().context("no active data source")?;
        Ok(source.signature.clone())
    }

    /// Parameterized predicate evaluation (§9 Decision: never string
    /// interpolation). `clauses` are AND-ed together.
    pub fn get_rows_by_filter(&self, clauses: &[FilterClause], limit: i64, offset: i64) -> Result<RowsPage> {
        let guard = self.active.lock().expect("gateway mutex poisoned");
        let source = guard.as_ref().context("no active data source")?;

        let matching: Vec<GatewayRow> = source
            .rows
            .iter()
            .filter(|row| clauses.iter().all(|c| matches(row, c)))
            .cloned()
            .collect();

        let total_count = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(RowsPage {
            rows: page,
            total_count,
        })
    }

    pub async fn write_back_single(&self, row_number: i64, tracking: &str, shipped_at: DateTime<Utc>) -> Result<()> {
        self.write_back_batch(&[(row_number, tracking.to_string(), shipped_at)]).await
    }

    /// Applies updates atomically (§4.4): a file rewrite for delimited and
    /// spreadsheet sources, one transaction of N UPDATEs for an editable
    /// database source, a companion-CSV rewrite otherwise. The in-memory
    /// field update and the file-based rewrites happen while holding the
    /// source lock; the database UPDATE transaction, which needs to await,
    /// runs after the lock is released.
    pub async fn write_back_batch(&self, updates: &[(i64, String, DateTime<Utc>)]) -> Result<()> {
        let pending_db_write = {
            let mut guard = self.active.lock().expect("gateway mutex poisoned");
            let source = guard.as_mut().context("no active data source")?;

            if !source.columns.iter().any(|c| c == "tracking_number") {
                source.columns.push("tracking_number".to_string());
            }
            if !source.columns.iter().any(|c| c == "shipped_at") {
                source.columns.push("shipped_at".to_string());
            }

            let key_column = match &source.write_target {
                WriteTarget::DirectUpdate { key_column, .. } => Some(key_column.clone()),
                _ => None,
            };

            let mut keyed_updates = Vec::with_capacity(updates.len());
            for (row_number, tracking, shipped_at) in updates {
                let row = source
                    .rows
                    .iter_mut()
                    .find(|r| r.row_number == *row_number)
                    .with_context(|| format!("row {row_number} not found in active source"))?;
                row.fields.insert("tracking_number".to_string(), tracking.clone());
                row.fields.insert("shipped_at".to_string(), shipped_at.to_rfc3339());

                if let Some(key_column) = &key_column {
                    let key_value = row
                        .fields
                        .get(key_column)
                        .cloned()
                        .with_context(|| format!("row {row_number} missing its write-back key column `{key_column}`"))?;
                    keyed_updates.push((key_value, tracking.clone(), *shipped_at));
                }
            }

            match &source.write_target {
                WriteTarget::DelimitedFile { path, delimiter } => {
                    delimited::write_delimited_atomic(path, *delimiter, &source.columns, &source.rows)?;
                    None
                }
                WriteTarget::SpreadsheetFile { path, sheet } => {
                    spreadsheet::write_spreadsheet_atomic(path, sheet, &source.columns, &source.rows)?;
                    None
                }
                WriteTarget::CompanionCsv { path } => {
                    delimited::write_delimited_atomic(path, b',', &source.columns, &source.rows)?;
                    None
                }
                WriteTarget::DirectUpdate { connection_string, table, key_column } => Some((
                    connection_string.clone(),
                    table.clone(),
                    key_column.clone(),
                    keyed_updates,
                )),
            }
        };

        if let Some((connection_string, table, key_column, keyed_updates)) = pending_db_write {
            write_back_database_batch(&connection_string, &table, &key_column, &keyed_updates).await?;
        }

        Ok(())
    }

    /// Re-applies tracking numbers recorded in the store, refusing if the
    /// currently loaded source's signature does not match the one recorded
    /// at job-create time (§4.4).
    pub async fn replay_write_back_from_job(
        &self,
        recorded_signature: &str,
        updates: &[(i64, String, DateTime<Utc>)],
    ) -> Result<()> {
        {
            let guard = self.active.lock().expect("gateway mutex poisoned");
            let source = guard.as_ref().context("no active data source")?;
            if source.signature != recorded_signature {
                bail!("loaded source signature does not match the job's recorded signature; refusing replay");
            }
        }
        self.write_back_batch(updates).await
    }
}

/// One transaction of N UPDATEs against an editable database write-back
/// target (§4.4). `table`/`key_column` are validated as plain identifiers
/// at `ImportDatabase` time, so interpolating them into the statement text
/// (table/column names can't be bound as query parameters) is safe.
async fn write_back_database_batch(
    connection_string: &str,
    table: &str,
    key_column: &str,
    keyed_updates: &[(String, String, DateTime<Utc>)],
) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(connection_string)
        .await
        .context("connect to write-back database failed")?;

    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS tracking_number TEXT"))
        .execute(&pool)
        .await
        .context("add tracking_number column failed")?;
    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS shipped_at TIMESTAMPTZ"))
        .execute(&pool)
        .await
        .context("add shipped_at column failed")?;

    let mut tx = pool.begin().await.context("begin write-back tx failed")?;
    for (key_value, tracking, shipped_at) in keyed_updates {
        sqlx::query(&format!("UPDATE {table} SET tracking_number = $1, shipped_at = $2 WHERE {key_column}::text = $3"))
            .bind(tracking)
            .bind(shipped_at)
            .bind(key_value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update {table} for key {key_value} failed"))?;
    }
    tx.commit().await.context("commit write-back tx failed")?;
    Ok(())
}

fn rows_from_raw(columns: &[String], raw_rows: Vec<Vec<String>>) -> Vec<GatewayRow> {
    raw_rows
        .into_iter()
        .enumerate()
        .map(|(idx, values)| {
            let fields: BTreeMap<String, String> = columns
                .iter()
                .cloned()
                .zip(values)
                .collect();
            GatewayRow {
                row_number: idx as i64 + 1,
                checksum: row_checksum(&fields),
                fields,
            }
        })
        .collect()
}

fn sha256_short(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn import_and_filter_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name,country").unwrap();
        writeln!(f, "Alice,US").unwrap();
        writeln!(f, "Bob,CA").unwrap();
        drop(f);

        let gateway = DataGateway::new();
        let info = gateway
            .import_delimited(path.to_str().unwrap(), b',', true)
            .unwrap();
        assert_eq!(info.row_count, 2);

        let page = gateway
            .get_rows_by_filter(
                &[FilterClause {
                    column: "country".to_string(),
                    op: FilterOp::Eq,
                    value: "US".to_string(),
                }],
                10,
                0,
            )
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.rows[0].fields["name"], "Alice");
    }

    #[tokio::test]
    async fn write_back_rewrites_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name,country").unwrap();
        writeln!(f, "Alice,US").unwrap();
        drop(f);

        let gateway = DataGateway::new();
        gateway.import_delimited(path.to_str().unwrap(), b',', true).unwrap();
        gateway
            .write_back_single(1, "1Z999", Utc::now())
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("1Z999"));
    }

    #[tokio::test]
    async fn replay_rejects_signature_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name,country").unwrap();
        writeln!(f, "Alice,US").unwrap();
        drop(f);

        let gateway = DataGateway::new();
        gateway.import_delimited(path.to_str().unwrap(), b',', true).unwrap();

        let err = gateway
            .replay_write_back_from_job("stale-signature", &[(1, "1Z1".to_string(), Utc::now())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn identifier_validation_rejects_punctuation() {
        assert!(valid_identifier("shipments"));
        assert!(valid_identifier("shipment_id"));
        assert!(!valid_identifier("shipments; DROP TABLE jobs"));
        assert!(!valid_identifier(""));
    }
}
