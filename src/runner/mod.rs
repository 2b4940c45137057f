//! Concurrent test execution.
//!
//! Every instrumented test writes to its own database directory
//! (`<cover_dir>_<index>`): the tool's on-disk format does not tolerate
//! concurrent writers, so sharing one directory would lose counts. The
//! directories are consolidated after the pass (see [`crate::db`]).
mod exec;
mod tap;

use crate::config::Config;
use crate::db;
use crate::pool::run_indexed;
use crate::scope::CoverOptions;
use crate::tool::{PerlTool, TestInvocation};
use crate::util::absolutize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub file: PathBuf,
    pub passed: bool,
    pub output: String,
    pub error: String,
    pub duration: Duration,
    /// Isolated database directory used by an instrumented run.
    pub cover_dir: Option<PathBuf>,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

/// Why a test that failed under instrumentation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triage {
    /// Passes without instrumentation.
    CoverageRelated,
    /// Fails either way.
    Genuine,
}

/// Running pass/fail counters, updated once per completion.
#[derive(Debug, Clone)]
pub struct Progress {
    total: usize,
    completed: usize,
    passed: usize,
    every: usize,
}

impl Progress {
    pub fn new(total: usize, every: usize) -> Self {
        Self {
            total,
            completed: 0,
            passed: 0,
            every: every.max(1),
        }
    }

    /// Count one completion; returns a status line every `every` completions and at the end.
    pub fn record(&mut self, passed: bool) -> Option<String> {
        self.completed += 1;
        if passed {
            self.passed += 1;
        }
        if self.completed % self.every != 0 && self.completed != self.total {
            return None;
        }
        Some(format!(
            "Progress: {}/{} tests completed ({} passed, {} failed)",
            self.completed,
            self.total,
            self.passed,
            self.completed - self.passed
        ))
    }
}

pub struct Executor<'a> {
    tool: &'a PerlTool,
    config: &'a Config,
}

impl<'a> Executor<'a> {
    pub fn new(tool: &'a PerlTool, config: &'a Config) -> Self {
        Self { tool, config }
    }

    /// Run every file under instrumentation, each into its own database directory.
    pub fn run_with_coverage(&self, files: &[PathBuf]) -> Vec<TestResult> {
        self.run_all(files, true)
    }

    /// Run files without instrumentation, to tell genuine failures apart.
    pub fn run_without_coverage(&self, files: &[PathBuf]) -> Vec<TestResult> {
        self.run_all(files, false)
    }

    fn run_all(&self, files: &[PathBuf], with_coverage: bool) -> Vec<TestResult> {
        let mut progress = Progress::new(files.len(), PROGRESS_EVERY);
        let results = run_indexed(
            files.len(),
            self.config.jobs,
            |index| {
                let cover_dir =
                    with_coverage.then(|| db::isolated_dir(&self.config.cover_dir, index));
                self.run_single(&files[index], cover_dir)
            },
            |_, result| {
                if let Some(line) = progress.record(result.passed) {
                    eprint!("\r{line}   ");
                }
            },
        );
        if !files.is_empty() {
            eprintln!();
        }
        results
    }

    fn run_single(&self, test_file: &Path, cover_dir: Option<PathBuf>) -> TestResult {
        let config = self.config;
        let abs_test = absolutize(test_file, &config.cwd);
        let includes: Vec<PathBuf> = config
            .include_paths
            .iter()
            .map(|path| absolutize(path, &config.cwd))
            .collect();

        let scope = cover_dir.as_deref().map(|db_dir| {
            CoverOptions {
                db_dir,
                cwd: &config.cwd,
                source_roots: &config.source_roots,
                ignore_dirs: &config.ignore_dirs,
                narrow: !config.no_select,
            }
            .for_test(test_file)
        });
        if let Some(module) = scope.as_ref().and_then(|scope| scope.module.as_deref()) {
            tracing::debug!(test = %test_file.display(), module, "narrowed instrumentation");
        }

        let cmd = self.tool.test_command(&TestInvocation {
            cwd: &config.cwd,
            include_paths: &includes,
            test_file: &abs_test,
            cover_options: scope.as_ref().map(|scope| scope.options.as_str()),
            json_db: config.json_merge,
        });

        match exec::run_captured(cmd, config.timeout, config.show_output) {
            Ok(run) => {
                let exit_ok = run.status.map(|status| status.success()).unwrap_or(false);
                let failure = tap::failure_text(exit_ok, run.timed_out, &run.stdout, &run.stderr);
                TestResult {
                    file: test_file.to_path_buf(),
                    passed: failure.is_none(),
                    error: failure.unwrap_or_default(),
                    output: run.stdout,
                    duration: run.duration,
                    cover_dir,
                    timed_out: run.timed_out,
                    exit_code: run.status.and_then(|status| status.code()),
                }
            }
            Err(err) => {
                tracing::warn!(test = %test_file.display(), error = %err, "test failed to start");
                TestResult {
                    file: test_file.to_path_buf(),
                    passed: false,
                    output: String::new(),
                    error: format!("{err:#}"),
                    duration: Duration::ZERO,
                    cover_dir,
                    timed_out: false,
                    exit_code: None,
                }
            }
        }
    }
}

pub fn failed_files(results: &[TestResult]) -> Vec<PathBuf> {
    results
        .iter()
        .filter(|result| !result.passed)
        .map(|result| result.file.clone())
        .collect()
}

/// Classify each rerun result against its instrumented failure.
pub fn triage(rerun: &[TestResult]) -> Vec<(PathBuf, Triage)> {
    rerun
        .iter()
        .map(|result| {
            let triage = if result.passed {
                Triage::CoverageRelated
            } else {
                Triage::Genuine
            };
            (result.file.clone(), triage)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(file: &str, passed: bool) -> TestResult {
        TestResult {
            file: PathBuf::from(file),
            passed,
            output: String::new(),
            error: String::new(),
            duration: Duration::ZERO,
            cover_dir: None,
            timed_out: false,
            exit_code: Some(if passed { 0 } else { 1 }),
        }
    }

    #[test]
    fn progress_reports_every_k_and_last() {
        let mut progress = Progress::new(12, 5);
        let lines: Vec<Option<String>> = (0..12).map(|i| progress.record(i % 3 != 0)).collect();
        let reported: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.is_some())
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(reported, vec![5, 10, 12]);
        assert_eq!(
            lines[11].as_deref(),
            Some("Progress: 12/12 tests completed (8 passed, 4 failed)")
        );
    }

    #[test]
    fn failed_files_keep_input_order() {
        let results = vec![
            result("t/a.t", false),
            result("t/b.t", true),
            result("t/c.t", false),
        ];
        assert_eq!(
            failed_files(&results),
            vec![PathBuf::from("t/a.t"), PathBuf::from("t/c.t")]
        );
    }

    #[test]
    fn triage_separates_coverage_related_failures() {
        let rerun = vec![result("t/a.t", true), result("t/c.t", false)];
        assert_eq!(
            triage(&rerun),
            vec![
                (PathBuf::from("t/a.t"), Triage::CoverageRelated),
                (PathBuf::from("t/c.t"), Triage::Genuine),
            ]
        );
    }
}
