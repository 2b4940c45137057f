use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const TEST_EXTENSION: &str = "t";

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_test_file(path: &Path) -> bool {
    path.extension().and_then(OsStr::to_str) == Some(TEST_EXTENSION)
}

/// Expand test paths into a sorted, deduplicated list of test files.
///
/// Directories are searched recursively for `*.t`; explicit files are kept
/// only when they are `*.t`. Paths are resolved against `cwd` and returned as
/// written.
pub fn find_test_files(paths: &[PathBuf], cwd: &Path) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for path in paths {
        let resolved = cwd.join(path);
        if resolved.is_file() {
            if is_test_file(path) {
                found.insert(path.clone());
            } else {
                tracing::debug!(path = %path.display(), "skipping non-test file");
            }
            continue;
        }
        if !resolved.is_dir() {
            return Err(anyhow!("test path not found: {}", path.display()));
        }
        for entry in WalkDir::new(&resolved)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
        {
            let entry = entry.with_context(|| format!("walk {}", resolved.display()))?;
            if !entry.file_type().is_file() || !is_test_file(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&resolved)
                .map(|rest| path.join(rest))
                .unwrap_or_else(|_| entry.path().to_path_buf());
            found.insert(relative);
        }
    }
    Ok(found.into_iter().collect())
}
