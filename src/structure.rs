//! Statement position to source line mapping.
//!
//! The instrumentation tool writes one structure file per instrumented source
//! file. Only the statement table is needed to attribute uncovered positions.
use crate::record::count_value;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureEntry {
    pub file: String,
    pub statement: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct WireStructure {
    file: Option<String>,
    #[serde(default)]
    statement: Option<Value>,
}

/// Read-only lookup shared by every file merge.
#[derive(Debug, Default, Clone)]
pub struct StructureIndex {
    lines: HashMap<String, Vec<u32>>,
}

impl StructureIndex {
    pub fn insert(&mut self, entry: StructureEntry) {
        let slot = self.lines.entry(entry.file).or_default();
        // Several digests can describe the same file; the longest table wins.
        if entry.statement.len() >= slot.len() {
            *slot = entry.statement;
        }
    }

    /// Source line for a statement position, falling back to `position + 1`.
    pub fn line_for(&self, file: &str, position: usize) -> u32 {
        self.lines
            .get(file)
            .and_then(|lines| lines.get(position))
            .copied()
            .filter(|line| *line > 0)
            .unwrap_or_else(|| u32::try_from(position + 1).unwrap_or(u32::MAX))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Extend<StructureEntry> for StructureIndex {
    fn extend<I: IntoIterator<Item = StructureEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry);
        }
    }
}

impl FromIterator<StructureEntry> for StructureIndex {
    fn from_iter<I: IntoIterator<Item = StructureEntry>>(iter: I) -> Self {
        let mut index = StructureIndex::default();
        index.extend(iter);
        index
    }
}

/// Parse one JSON structure file. Returns `None` when it names no file.
pub fn parse_structure(bytes: &[u8]) -> Result<Option<StructureEntry>> {
    let wire: WireStructure =
        serde_json::from_slice(bytes).context("parse structure JSON")?;
    Ok(structure_from_wire(wire))
}

pub fn structure_from_value(value: Value) -> Result<Option<StructureEntry>> {
    let wire: WireStructure = serde_json::from_value(value).context("decode structure")?;
    Ok(structure_from_wire(wire))
}

fn structure_from_wire(wire: WireStructure) -> Option<StructureEntry> {
    let file = wire.file?;
    let statement = match wire.statement {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| u32::try_from(count_value(item)).unwrap_or(0))
            .collect(),
        _ => Vec::new(),
    };
    Some(StructureEntry { file, statement })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_positions_and_falls_back_to_position_plus_one() {
        let entry = parse_structure(br#"{"file": "lib/Foo.pm", "digest": "d", "statement": [3, 7, 9]}"#)
            .expect("parse")
            .expect("entry");
        let index: StructureIndex = [entry].into_iter().collect();
        assert_eq!(index.line_for("lib/Foo.pm", 1), 7);
        assert_eq!(index.line_for("lib/Foo.pm", 5), 6);
        assert_eq!(index.line_for("lib/Other.pm", 0), 1);
    }

    #[test]
    fn structure_without_file_is_ignored() {
        assert_eq!(parse_structure(br#"{"statement": [1]}"#).expect("parse"), None);
    }

    #[test]
    fn longer_table_replaces_shorter_one() {
        let mut index = StructureIndex::default();
        index.insert(StructureEntry {
            file: "a.pm".to_string(),
            statement: vec![10],
        });
        index.insert(StructureEntry {
            file: "a.pm".to_string(),
            statement: vec![10, 20],
        });
        assert_eq!(index.line_for("a.pm", 1), 20);
        assert_eq!(index.len(), 1);
    }
}
