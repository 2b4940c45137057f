//! Canonical per-run coverage records.
//!
//! A record mirrors one run entry of a `runs/<id>/cover.<n>` data file: counts
//! indexed by position inside the instrumented file, not yet mapped to lines.
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw counters for one source file within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCounts {
    pub statement: Vec<u64>,
    /// `[true_count, false_count]` per branch position.
    pub branch: Vec<[u64; 2]>,
    /// One slot per evaluated truth state, per condition position.
    pub condition: Vec<Vec<u64>>,
    pub subroutine: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRunRecord {
    pub run_id: String,
    pub files: BTreeMap<String, FileCounts>,
}

#[derive(Debug, Deserialize)]
struct DbDocument {
    #[serde(default)]
    runs: BTreeMap<String, RunEntry>,
}

#[derive(Debug, Deserialize)]
struct RunEntry {
    #[serde(default)]
    count: Option<BTreeMap<String, WireCounts>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireCounts {
    #[serde(default)]
    statement: Option<Value>,
    #[serde(default)]
    branch: Option<Value>,
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    subroutine: Option<Value>,
}

/// Parse a JSON-encoded database document into one record per run.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<RawRunRecord>> {
    let doc: DbDocument = serde_json::from_slice(bytes).context("parse coverage run JSON")?;
    Ok(records_from_document(doc))
}

/// Same as [`parse_records`] for an already-decoded JSON value.
pub fn records_from_value(value: Value) -> Result<Vec<RawRunRecord>> {
    let doc: DbDocument = serde_json::from_value(value).context("decode coverage runs")?;
    Ok(records_from_document(doc))
}

fn records_from_document(doc: DbDocument) -> Vec<RawRunRecord> {
    doc.runs
        .into_iter()
        .filter_map(|(run_id, entry)| {
            let count = entry.count?;
            let files = count
                .into_iter()
                .map(|(path, wire)| (path, file_counts(wire)))
                .collect();
            Some(RawRunRecord { run_id, files })
        })
        .collect()
}

fn file_counts(wire: WireCounts) -> FileCounts {
    FileCounts {
        statement: flat_counts(wire.statement.as_ref()),
        branch: nested_counts(wire.branch.as_ref())
            .into_iter()
            .map(|arms| {
                [
                    arms.first().copied().unwrap_or(0),
                    arms.get(1).copied().unwrap_or(0),
                ]
            })
            .collect(),
        condition: nested_counts(wire.condition.as_ref()),
        subroutine: flat_counts(wire.subroutine.as_ref()),
    }
}

fn flat_counts(value: Option<&Value>) -> Vec<u64> {
    match value {
        Some(Value::Array(items)) => items.iter().map(count_value).collect(),
        _ => Vec::new(),
    }
}

fn nested_counts(value: Option<&Value>) -> Vec<Vec<u64>> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Array(slots) => slots.iter().map(count_value).collect(),
                Value::Null => Vec::new(),
                other => vec![count_value(other)],
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Lenient hit count: numbers as-is, arrays by their first slot, anything else 0.
pub(crate) fn count_value(value: &Value) -> u64 {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v > 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Value::Array(items) => items.first().map(count_value).unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        Value::Bool(flag) => u64::from(*flag),
        Value::Null | Value::Object(_) => 0,
    }
}
