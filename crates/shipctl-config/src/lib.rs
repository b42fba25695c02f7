//! Environment-derived configuration, resolved once at process start into
//! typed structs rather than scattered `std::env::var` calls (§6.3, §9a).

pub mod secrets;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub use secrets::{CarrierCredentials, ResolvedSecrets, ShipperFallback};

/// `SHIPCTL_MODE` — decides which secrets are mandatory at startup (§6.3).
/// `Debug` is implemented by hand in `secrets` alongside the other
/// redaction-aware impls, so it is not derived here.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Paper,
    Live,
}

impl RunMode {
    pub fn from_env() -> Result<Self> {
        match std::env::var("SHIPCTL_MODE").as_deref() {
            Ok("paper") | Err(_) => Ok(RunMode::Paper),
            Ok("live") => Ok(RunMode::Live),
            Ok(other) => bail!("unknown SHIPCTL_MODE: {other} (expected paper|live)"),
        }
    }
}

/// Root of the labels directory; all label I/O (§6.1) must stay confined
/// under this path.
#[derive(Debug, Clone)]
pub struct LabelsConfig {
    pub root: PathBuf,
}

impl LabelsConfig {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("SHIPCTL_LABELS_DIR").context("SHIPCTL_LABELS_DIR not set")?;
        let root = std::fs::canonicalize(&raw)
            .with_context(|| format!("labels dir does not exist: {raw}"))?;
        Ok(Self { root })
    }

    /// Resolve a caller-supplied relative path and refuse anything that
    /// escapes `root` (§6.1: "any path escaping it returns 403").
    pub fn confine(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.root.join(relative);
        let canonical = match joined.canonicalize() {
            Ok(p) => p,
            // File may not exist yet (e.g. about to be written); canonicalize
            // the parent and re-append the file name instead.
            Err(_) => {
                let parent = joined
                    .parent()
                    .context("label path has no parent")?
                    .canonicalize()
                    .context("label parent does not exist")?;
                parent.join(joined.file_name().context("label path has no file name")?)
            }
        };
        if !canonical.starts_with(&self.root) {
            bail!("path escapes labels root: {relative}");
        }
        Ok(canonical)
    }
}

/// Root directory for per-run hash-chained decision ledgers (§9a, the audit
/// writer). Unlike `LabelsConfig`'s root, this directory is internal
/// bookkeeping rather than a user-facing I/O boundary, so it is created if
/// missing instead of being required to pre-exist.
#[derive(Debug, Clone)]
pub struct DecisionLedgerConfig {
    pub root: PathBuf,
}

impl DecisionLedgerConfig {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("SHIPCTL_DECISIONS_DIR").unwrap_or_else(|_| "./data/decisions".to_string());
        std::fs::create_dir_all(&raw).with_context(|| format!("create decisions dir: {raw}"))?;
        let root = std::fs::canonicalize(&raw)
            .with_context(|| format!("canonicalize decisions dir: {raw}"))?;
        Ok(Self { root })
    }

    pub fn ledger_path(&self, run_id: uuid::Uuid) -> PathBuf {
        self.root.join(format!("{run_id}.jsonl"))
    }
}

/// Database connection string for C1.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub migrate_on_startup: bool,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let migrate_on_startup = std::env::var("SHIPCTL_MIGRATE_ON_STARTUP")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);
        Ok(Self {
            database_url,
            migrate_on_startup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_defaults_to_paper_when_unset() {
        std::env::remove_var("SHIPCTL_MODE");
        assert_eq!(RunMode::from_env().unwrap(), RunMode::Paper);
    }
}
