//! Database file encodings and the decoders that read them.
//!
//! A data file is JSON iff its first byte is `{`. JSON files are parsed
//! in-process on the worker pool; anything else goes through the
//! [`NativeCodec`] in one batch, either decoded directly or, when JSON
//! processing is forced, rewritten as JSON first.
use crate::db::CoverDb;
use crate::merge::CoverageMerger;
use crate::pool::run_indexed;
use crate::record::{parse_records, records_from_value};
use crate::report::Report;
use crate::structure::{parse_structure, structure_from_value, StructureEntry, StructureIndex};
use crate::tool::NativeCodec;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Native,
}

pub fn sniff_bytes(bytes: &[u8]) -> Encoding {
    match bytes.first() {
        Some(b'{') => Encoding::Json,
        _ => Encoding::Native,
    }
}

pub fn sniff_encoding(path: &Path) -> Result<Encoding> {
    let mut first = [0u8; 1];
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let read = file
        .read(&mut first)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(sniff_bytes(&first[..read]))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub runs_seen: usize,
    pub runs_merged: usize,
    pub skipped_runs: usize,
    pub json_runs: usize,
    pub native_runs: usize,
    pub converted_runs: usize,
}

/// Merged counters plus everything needed to turn them into a report.
#[derive(Debug, Default)]
pub struct DecodedDb {
    pub merger: CoverageMerger,
    pub structure: StructureIndex,
    pub stats: MergeStats,
}

impl DecodedDb {
    pub fn report(&self) -> Report {
        self.merger.finish(&self.structure)
    }
}

/// Reads one group of same-encoding files.
pub enum Decoder<'a> {
    Json { jobs: usize },
    Native(&'a dyn NativeCodec),
}

#[derive(Debug, Default)]
struct Partial {
    merger: CoverageMerger,
    structure: Vec<StructureEntry>,
    merged: usize,
    skipped: usize,
}

impl Decoder<'_> {
    fn decode(&self, runs: &[PathBuf], structures: &[PathBuf]) -> Partial {
        match self {
            Decoder::Json { jobs } => decode_json(runs, structures, *jobs),
            Decoder::Native(codec) => decode_native(*codec, runs, structures),
        }
    }
}

fn decode_json(runs: &[PathBuf], structures: &[PathBuf], jobs: usize) -> Partial {
    let mut partial = Partial::default();
    let parsed = run_indexed(
        runs.len(),
        jobs,
        |index| {
            let path = &runs[index];
            let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            let records = parse_records(&bytes)?;
            Ok::<_, anyhow::Error>(records.iter().collect::<CoverageMerger>())
        },
        |_, _| {},
    );
    for (path, result) in runs.iter().zip(parsed) {
        match result {
            Ok(merger) => {
                partial.merger.merge(merger);
                partial.merged += 1;
            }
            Err(err) => {
                tracing::warn!(run = %path.display(), error = %err, "skipping unreadable run");
                partial.skipped += 1;
            }
        }
    }

    for path in structures {
        let parsed = fs::read(path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|bytes| parse_structure(&bytes));
        match parsed {
            Ok(Some(entry)) => partial.structure.push(entry),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(structure = %path.display(), error = %err, "skipping structure file");
            }
        }
    }
    partial
}

fn decode_native(codec: &dyn NativeCodec, runs: &[PathBuf], structures: &[PathBuf]) -> Partial {
    let mut partial = Partial::default();
    if runs.is_empty() && structures.is_empty() {
        return partial;
    }
    let batch = match codec.decode_native(runs, structures) {
        Ok(batch) => batch,
        Err(err) => {
            tracing::warn!(runs = runs.len(), error = %err, "native decode failed");
            partial.skipped = runs.len();
            return partial;
        }
    };

    let failed: HashSet<&Path> = batch.failed.iter().map(|f| f.path.as_path()).collect();
    for failure in &batch.failed {
        tracing::warn!(file = %failure.path.display(), error = %failure.error, "skipping undecodable file");
    }
    let failed_runs = runs.iter().filter(|path| failed.contains(path.as_path())).count();

    let mut merger = CoverageMerger::default();
    let mut bad_entries = 0;
    match batch.runs {
        Value::Null => {}
        Value::Object(entries) => {
            for (id, entry) in entries {
                match records_from_value(serde_json::json!({ "runs": { id.as_str(): entry } })) {
                    Ok(records) => {
                        for record in &records {
                            merger.add_record(record);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(run = %id, error = %err, "skipping malformed native run");
                        bad_entries += 1;
                    }
                }
            }
        }
        _ => {
            tracing::warn!("native decode returned malformed runs");
            partial.skipped = runs.len();
            return partial;
        }
    }
    partial.merger = merger;
    partial.skipped = (failed_runs + bad_entries).min(runs.len());
    partial.merged = runs.len() - partial.skipped;

    for value in batch.structure {
        match structure_from_value(value) {
            Ok(Some(entry)) => partial.structure.push(entry),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "skipping native structure"),
        }
    }
    partial
}

pub struct FormatAdapter<'a> {
    codec: &'a dyn NativeCodec,
    force_json: bool,
    jobs: usize,
}

impl<'a> FormatAdapter<'a> {
    pub fn new(codec: &'a dyn NativeCodec, force_json: bool, jobs: usize) -> Self {
        Self {
            codec,
            force_json,
            jobs: jobs.max(1),
        }
    }

    pub fn load(&self, db: &CoverDb) -> Result<DecodedDb> {
        let runs = db.run_data_files()?;
        let structures = db.structure_files()?;
        tracing::debug!(
            runs = runs.len(),
            structures = structures.len(),
            db = %db.root().display(),
            "loading coverage database"
        );
        Ok(self.load_files(&runs, &structures))
    }

    /// Decode and merge every file. Unreadable runs are skipped and counted.
    pub fn load_files(&self, runs: &[PathBuf], structures: &[PathBuf]) -> DecodedDb {
        let mut stats = MergeStats {
            runs_seen: runs.len(),
            ..MergeStats::default()
        };

        let (mut json_runs, mut native_runs, unreadable) = classify(runs);
        stats.skipped_runs += unreadable;
        let (mut json_structures, mut native_structures, _) = classify(structures);

        if self.force_json && (!native_runs.is_empty() || !native_structures.is_empty()) {
            let converted = self.convert(&mut native_runs, &mut json_runs);
            stats.converted_runs = converted;
            self.convert(&mut native_structures, &mut json_structures);
        }
        stats.json_runs = json_runs.len();
        stats.native_runs = native_runs.len();

        let mut decoded = DecodedDb::default();
        let groups = [
            (Decoder::Json { jobs: self.jobs }, json_runs, json_structures),
            (Decoder::Native(self.codec), native_runs, native_structures),
        ];
        for (decoder, group_runs, group_structures) in groups {
            let partial = decoder.decode(&group_runs, &group_structures);
            decoded.merger.merge(partial.merger);
            decoded.structure.extend(partial.structure);
            stats.runs_merged += partial.merged;
            stats.skipped_runs += partial.skipped;
        }
        if decoded.structure.is_empty() && stats.runs_merged > 0 {
            tracing::debug!("no structure data; uncovered lines fall back to positions");
        }
        tracing::debug!(
            files = decoded.merger.file_count(),
            structures = decoded.structure.len(),
            runs = decoded.merger.runs(),
            "merged coverage runs"
        );
        decoded.stats = stats;
        decoded
    }

    /// Rewrite `native` files as JSON; those that now sniff as JSON move to `json`.
    fn convert(&self, native: &mut Vec<PathBuf>, json: &mut Vec<PathBuf>) -> usize {
        if native.is_empty() {
            return 0;
        }
        let outcome = match self.codec.convert_to_json(native) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(files = native.len(), error = %err, "JSON conversion failed; decoding natively");
                return 0;
            }
        };
        for failure in &outcome.failed {
            tracing::warn!(file = %failure.path.display(), error = %failure.error, "could not convert to JSON");
        }
        let converted: HashSet<PathBuf> = outcome.converted.into_iter().collect();
        let mut moved = 0;
        native.retain(|path| {
            let now_json = converted.contains(path)
                && matches!(sniff_encoding(path), Ok(Encoding::Json));
            if now_json {
                json.push(path.clone());
                moved += 1;
            }
            !now_json
        });
        moved
    }
}

/// Split files by encoding; the count is files that could not be read at all.
fn classify(files: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>, usize) {
    let mut json = Vec::new();
    let mut native = Vec::new();
    let mut unreadable = 0;
    for path in files {
        match sniff_encoding(path) {
            Ok(Encoding::Json) => json.push(path.clone()),
            Ok(Encoding::Native) => native.push(path.clone()),
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "skipping unreadable file");
                unreadable += 1;
            }
        }
    }
    (json, native, unreadable)
}
