//! Append-only, hash-chained decision ledger (§3 DecisionRun + DecisionEvent,
//! §8 invariant 5). Events are written as JSON Lines; each event's integrity
//! hash covers (prev_hash, seq, payload_hash), so tampering with or
//! reordering any line breaks the chain from that point forward.
//!
//! Sensitive fields (carrier credentials, account numbers) are redacted out
//! of the payload before it is hashed and written — the chain protects the
//! redacted record, not the secret.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const SENSITIVE_KEYS: &[&str] = &["client_secret", "account_number", "password", "token"];

/// Recursively redact named sensitive keys from a JSON value in place.
pub fn redact_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&k.as_str()) {
                    *v = Value::String("<REDACTED>".to_string());
                } else {
                    redact_sensitive(v);
                }
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                redact_sensitive(v);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub seq: i64,
    pub ts_utc: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

fn canonicalize(v: &Value) -> String {
    serde_json::to_string(&sort_keys(v)).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Appends DecisionEvents for one DecisionRun to a JSONL file, resuming the
/// hash chain from wherever the file left off.
pub struct DecisionWriter {
    path: PathBuf,
    run_id: Uuid,
    next_seq: i64,
    last_event_hash: Option<String>,
}

impl DecisionWriter {
    /// Open (creating if absent) a decision ledger file for `run_id`,
    /// replaying any existing lines to resume `next_seq`/`last_event_hash`.
    pub fn open(path: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (next_seq, last_event_hash) = if path.exists() {
            match verify_hash_chain(&path)? {
                VerifyResult::Ok { count, last_hash } => (count + 1, last_hash),
                VerifyResult::Broken { at_seq, reason } => {
                    bail!("decision ledger {path:?} is corrupt at seq {at_seq}: {reason}")
                }
            }
        } else {
            File::create(&path)
                .with_context(|| format!("create decision ledger: {}", path.display()))?;
            (1, None)
        };

        Ok(Self {
            path,
            run_id,
            next_seq,
            last_event_hash,
        })
    }

    /// Append one decision event. `payload` is redacted before hashing.
    pub fn append(&mut self, job_id: Uuid, kind: &str, mut payload: Value) -> Result<DecisionEvent> {
        redact_sensitive(&mut payload);
        let payload_hash = sha256_hex(canonicalize(&payload).as_bytes());

        let chain_input = serde_json::json!({
            "prev_event_hash": self.last_event_hash,
            "seq": self.next_seq,
            "payload_hash": payload_hash,
        });
        let event_hash = sha256_hex(canonicalize(&chain_input).as_bytes());

        let event = DecisionEvent {
            event_id: Uuid::new_v4(),
            run_id: self.run_id,
            job_id,
            seq: self.next_seq,
            ts_utc: Utc::now(),
            kind: kind.to_string(),
            payload,
            payload_hash,
            prev_event_hash: self.last_event_hash.clone(),
            event_hash: event_hash.clone(),
        };

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open decision ledger for append: {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(&event)?)
            .with_context(|| format!("append decision ledger: {}", self.path.display()))?;

        self.next_seq += 1;
        self.last_event_hash = Some(event_hash);

        Ok(event)
    }

    /// Number of events appended to this ledger so far (including those
    /// replayed from a prior run of the same `run_id`).
    pub fn event_count(&self) -> i64 {
        self.next_seq - 1
    }

    /// Hash of the most recently appended event, if any.
    pub fn last_event_hash(&self) -> Option<&str> {
        self.last_event_hash.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Ok { count: i64, last_hash: Option<String> },
    Broken { at_seq: i64, reason: String },
}

/// Replay a decision ledger file and verify every event's chain hash.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("open decision ledger: {}", path.as_ref().display()))?;
    verify_hash_chain_reader(BufReader::new(file))
}

pub fn verify_hash_chain_str(contents: &str) -> Result<VerifyResult> {
    verify_hash_chain_reader(contents.as_bytes())
}

fn verify_hash_chain_reader(reader: impl BufRead) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut count = 0i64;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: DecisionEvent = serde_json::from_str(&line)
            .with_context(|| format!("parse decision event at line {idx}"))?;

        if event.seq != count + 1 {
            return Ok(VerifyResult::Broken {
                at_seq: event.seq,
                reason: format!("expected seq {}, found {}", count + 1, event.seq),
            });
        }
        if event.prev_event_hash != prev_hash {
            return Ok(VerifyResult::Broken {
                at_seq: event.seq,
                reason: "prev_event_hash does not match preceding event".to_string(),
            });
        }

        let chain_input = serde_json::json!({
            "prev_event_hash": event.prev_event_hash,
            "seq": event.seq,
            "payload_hash": event.payload_hash,
        });
        let expected_hash = sha256_hex(canonicalize(&chain_input).as_bytes());
        if expected_hash != event.event_hash {
            return Ok(VerifyResult::Broken {
                at_seq: event.seq,
                reason: "event_hash does not match recomputed hash".to_string(),
            });
        }

        count += 1;
        prev_hash = Some(event.event_hash);
    }

    Ok(VerifyResult::Ok {
        count,
        last_hash: prev_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn redacts_nested_secret_keys() {
        let mut v = serde_json::json!({
            "carrier": {"client_secret": "s3cr3t", "base_url": "https://x"},
            "items": [{"account_number": "ACC-1"}],
        });
        redact_sensitive(&mut v);
        assert_eq!(v["carrier"]["client_secret"], "<REDACTED>");
        assert_eq!(v["carrier"]["base_url"], "https://x");
        assert_eq!(v["items"][0]["account_number"], "<REDACTED>");
    }

    #[test]
    fn chain_grows_and_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let run_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let mut writer = DecisionWriter::open(&path, run_id).unwrap();
        writer.append(job_id, "job_confirmed", serde_json::json!({"a": 1})).unwrap();
        writer.append(job_id, "row_completed", serde_json::json!({"row": 1})).unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Ok { count, .. } => assert_eq!(count, 2),
            VerifyResult::Broken { reason, .. } => panic!("chain broken: {reason}"),
        }
    }

    #[test]
    fn tampered_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let run_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let mut writer = DecisionWriter::open(&path, run_id).unwrap();
        writer.append(job_id, "job_confirmed", serde_json::json!({"a": 1})).unwrap();
        writer.append(job_id, "row_completed", serde_json::json!({"row": 1})).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = contents.lines().collect();
        let tampered = lines[0].replace("job_confirmed", "job_cancelled");
        lines[0] = &tampered;
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Ok { .. } => panic!("expected broken chain"),
            VerifyResult::Broken { at_seq, .. } => assert_eq!(at_seq, 1),
        }
    }

    #[test]
    fn resuming_writer_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let run_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        {
            let mut writer = DecisionWriter::open(&path, run_id).unwrap();
            writer.append(job_id, "job_confirmed", serde_json::json!({})).unwrap();
        }
        {
            let mut writer = DecisionWriter::open(&path, run_id).unwrap();
            let ev = writer.append(job_id, "row_completed", serde_json::json!({})).unwrap();
            assert_eq!(ev.seq, 2);
        }
    }
}
