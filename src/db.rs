//! On-disk database layout.
//!
//! ```text
//! cover_db/
//!   runs/<run-id>/cover.<n>    one data file per run
//!   structure/<digest>         one structure file per instrumented source file
//! cover_db_<i>/                isolated database of test <i>, same layout
//! ```
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RUNS_DIR: &str = "runs";
const STRUCTURE_DIR: &str = "structure";
const DATA_FILE_PREFIX: &str = "cover.";

/// Isolated database directory for the test at `index`.
pub fn isolated_dir(cover_dir: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}_{index}", cover_dir.display()))
}

/// Remove the final database and isolated directories left by a previous run.
pub fn clean_stale(cover_dir: &Path, count: usize) -> Result<()> {
    remove_dir_if_present(cover_dir)?;
    for index in 0..count {
        let dir = isolated_dir(cover_dir, index);
        if let Err(err) = remove_dir_if_present(&dir) {
            tracing::debug!(dir = %dir.display(), error = %err, "could not remove stale isolated dir");
        }
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidateStats {
    pub runs_moved: usize,
    pub structures_moved: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct CoverDb {
    root: PathBuf,
}

impl CoverDb {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    pub fn structure_dir(&self) -> PathBuf {
        self.root.join(STRUCTURE_DIR)
    }

    /// Move runs and structure files of each isolated database into this one.
    ///
    /// Run ids are unique per process, so runs never collide; structure files
    /// are content-addressed, so an existing digest is skipped.
    pub fn consolidate(&self, isolated: &[PathBuf], keep_isolated: bool) -> Result<ConsolidateStats> {
        let mut stats = ConsolidateStats::default();
        fs::create_dir_all(self.runs_dir())
            .with_context(|| format!("create {}", self.runs_dir().display()))?;
        fs::create_dir_all(self.structure_dir())
            .with_context(|| format!("create {}", self.structure_dir().display()))?;

        for source in isolated {
            if !source.is_dir() {
                tracing::debug!(dir = %source.display(), "isolated database missing");
                continue;
            }
            let source_db = CoverDb::new(source.clone());
            for entry in list_entries(&source_db.runs_dir())? {
                let moved = move_entry(&entry, &self.runs_dir(), keep_isolated)?;
                if moved {
                    stats.runs_moved += 1;
                } else {
                    stats.duplicates_skipped += 1;
                    tracing::warn!(run = %entry.display(), "run id already present; skipped");
                }
            }
            for entry in list_entries(&source_db.structure_dir())? {
                if move_entry(&entry, &self.structure_dir(), keep_isolated)? {
                    stats.structures_moved += 1;
                } else {
                    stats.duplicates_skipped += 1;
                }
            }
            if !keep_isolated {
                remove_dir_if_present(source)?;
            }
        }
        Ok(stats)
    }

    /// One data file per run directory, sorted for determinism.
    pub fn run_data_files(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.is_dir() {
            tracing::warn!(dir = %runs_dir.display(), "no coverage runs found");
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for run_dir in list_entries(&runs_dir)? {
            if !run_dir.is_dir() {
                continue;
            }
            match data_file(&run_dir)? {
                Some(file) => files.push(file),
                None => tracing::warn!(run = %run_dir.display(), "run directory has no data file"),
            }
        }
        Ok(files)
    }

    pub fn structure_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.structure_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(list_entries(&dir)?
            .into_iter()
            .filter(|path| path.is_file() && !is_lock_file(path))
            .collect())
    }
}

/// `cover.<n>` if present, else the first regular file.
pub fn data_file(run_dir: &Path) -> Result<Option<PathBuf>> {
    let files: Vec<PathBuf> = list_entries(run_dir)?
        .into_iter()
        .filter(|path| path.is_file() && !is_lock_file(path))
        .collect();
    let preferred = files.iter().find(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(DATA_FILE_PREFIX))
    });
    Ok(preferred.or_else(|| files.first()).cloned())
}

fn is_lock_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "lock")
}

fn list_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("list {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}

/// Returns `false` when the destination already exists.
fn move_entry(entry: &Path, dest_dir: &Path, copy: bool) -> Result<bool> {
    let Some(name) = entry.file_name() else {
        return Ok(false);
    };
    let dest = dest_dir.join(name);
    if dest.exists() {
        return Ok(false);
    }
    if copy {
        copy_recursive(entry, &dest)?;
    } else if fs::rename(entry, &dest).is_err() {
        copy_recursive(entry, &dest)?;
    }
    Ok(true)
}

fn copy_recursive(source: &Path, dest: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
        for entry in list_entries(source)? {
            if let Some(name) = entry.file_name() {
                copy_recursive(&entry, &dest.join(name))?;
            }
        }
    } else {
        fs::copy(source, dest)
            .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
    }
    Ok(())
}
