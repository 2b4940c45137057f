//! End-to-end coverage run: check, discover, execute, consolidate, triage,
//! merge, normalize, report.
use crate::config::Config;
use crate::db::{self, CoverDb};
use crate::discover;
use crate::format::{FormatAdapter, MergeStats};
use crate::normalize::normalize;
use crate::report::{format_percent, render_table, CoverageSummary, FileCoverage, Report};
use crate::runner::{failed_files, triage, Executor, TestResult, Triage};
use crate::tool::PerlTool;
use crate::util::{display_path, truncate_string};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

const ERROR_PREVIEW_LINES: usize = 5;
const ERROR_LINE_BYTES: usize = 200;

/// Human-readable progress goes to stdout, or to stderr when stdout carries JSON.
struct Console {
    json: bool,
}

impl Console {
    fn line(&self, text: impl AsRef<str>) {
        if self.json {
            eprintln!("{}", text.as_ref());
        } else {
            println!("{}", text.as_ref());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub total: usize,
    pub passed: usize,
    /// Failed under instrumentation but passed without it.
    pub coverage_related: usize,
    /// Failed after triage; drives the exit status.
    pub failed: usize,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub tests: TestCounts,
    pub merge: MergeStats,
    pub report: Report,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.tests.failed == 0
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    tests: TestCounts,
    merge: MergeStats,
    normalization: Vec<&'static str>,
    summary: &'a CoverageSummary,
    files: &'a BTreeMap<String, FileCoverage>,
}

pub fn run(config: &Config) -> Result<RunOutcome> {
    let console = Console { json: config.json };
    let tool = PerlTool::new(config.perl_path.clone(), config.perl_switches.clone());
    let version = tool.check_installed()?;
    tracing::debug!(perl = %tool.perl().display(), "Devel::Cover available");
    console.line(format!("Using Devel::Cover version {version}"));

    let files = discover::find_test_files(&config.test_paths, &config.cwd)
        .context("failed to discover tests")?;
    if files.is_empty() {
        return Err(anyhow!("no test files found"));
    }
    console.line(format!("Found {} test files", files.len()));

    db::clean_stale(&config.cover_dir, files.len())
        .context("failed to clean coverage directory")?;

    let executor = Executor::new(&tool, config);
    let start = Instant::now();
    let results = executor.run_with_coverage(&files);
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        tests = results.len(),
        jobs = config.jobs,
        "instrumented pass complete"
    );

    let cover_db = CoverDb::new(config.cover_dir.clone());
    let isolated: Vec<PathBuf> = results.iter().filter_map(|r| r.cover_dir.clone()).collect();
    if !isolated.is_empty() {
        if config.verbose {
            console.line(format!("Merging {} coverage directories...", isolated.len()));
        }
        let stats = cover_db
            .consolidate(&isolated, config.keep_isolated)
            .context("failed to merge coverage directories")?;
        tracing::debug!(
            runs = stats.runs_moved,
            structures = stats.structures_moved,
            duplicates = stats.duplicates_skipped,
            "consolidated isolated databases"
        );
    }

    print_test_results(&console, &results, config);

    let failed = failed_files(&results);
    let mut tests = TestCounts {
        total: results.len(),
        passed: results.len() - failed.len(),
        coverage_related: 0,
        failed: failed.len(),
    };
    if !failed.is_empty() && !config.no_rerun_failed {
        console.line("\n--- Rerunning failed tests without Devel::Cover ---");
        let rerun = executor.run_without_coverage(&failed);
        let triaged = triage(&rerun);
        print_rerun_results(&console, &triaged);
        tests.coverage_related = triaged
            .iter()
            .filter(|(_, kind)| *kind == Triage::CoverageRelated)
            .count();
        tests.failed = triaged.len() - tests.coverage_related;
    }

    console.line("\n--- Coverage Report ---");
    let adapter = FormatAdapter::new(&tool, config.json_merge, config.jobs);
    let start = Instant::now();
    let decoded = adapter.load(&cover_db).context("failed to parse coverage")?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        runs = decoded.stats.runs_merged,
        skipped = decoded.stats.skipped_runs,
        converted = decoded.stats.converted_runs,
        "coverage merged"
    );
    if decoded.stats.skipped_runs > 0 {
        console.line(format!(
            "Warning: skipped {} of {} coverage runs that could not be read",
            decoded.stats.skipped_runs, decoded.stats.runs_seen
        ));
    }

    let mut report = decoded.report();
    normalize(&mut report, &config.normalization);

    if config.json {
        let json = JsonReport {
            tests,
            merge: decoded.stats,
            normalization: config.normalization.modes().map(|m| m.as_str()).collect(),
            summary: &report.summary,
            files: &report.files,
        };
        let text = serde_json::to_string_pretty(&json).context("serialize coverage report")?;
        println!("{text}");
    } else {
        print!("{}", render_table(&report, config.verbose));
    }

    if config.html {
        console.line("\nWARNING: HTML report generation using 'cover' can be very slow");
        console.line("   For large codebases, this may take several minutes...");
        tool.render_html(&config.cover_dir, config.json)
            .context("failed to generate HTML report")?;
        console.line(format!(
            "\nHTML report generated: {}",
            config.cover_dir.join("coverage.html").display()
        ));
    }

    console.line("\n=== Summary ===");
    let mut tests_line = format!(
        "Tests: {} passed, {} failed, {} total",
        tests.passed, tests.failed, tests.total
    );
    if tests.coverage_related > 0 {
        tests_line.push_str(&format!(
            " ({} failed only under Devel::Cover)",
            tests.coverage_related
        ));
    }
    console.line(tests_line);
    console.line(format!(
        "Coverage: {} statement, {} branch",
        format_percent(report.summary.statement),
        format_percent(report.summary.branch)
    ));

    Ok(RunOutcome {
        tests,
        merge: decoded.stats,
        report,
    })
}

fn print_test_results(console: &Console, results: &[TestResult], config: &Config) {
    console.line("\n--- Test Results ---");
    for result in results {
        let status = if result.passed { "✓" } else { "✗" };
        let mut line = format!(
            "{status} {} ({:.2}s)",
            display_path(&result.file, Some(&config.cwd)),
            result.duration.as_secs_f64()
        );
        if result.timed_out {
            line.push_str(" [timed out]");
        }
        console.line(line);
        if result.passed || result.error.is_empty() {
            continue;
        }
        for detail in error_preview(&result.error) {
            console.line(format!("      {detail}"));
        }
    }
}

/// First lines of a failure, plus a marker for how many were left out.
fn error_preview(error: &str) -> Vec<String> {
    let lines: Vec<&str> = error.lines().collect();
    let mut preview: Vec<String> = lines
        .iter()
        .take(ERROR_PREVIEW_LINES)
        .map(|line| truncate_string(line, ERROR_LINE_BYTES))
        .collect();
    if lines.len() > ERROR_PREVIEW_LINES {
        preview.push(format!(
            "... ({} more lines)",
            lines.len() - ERROR_PREVIEW_LINES
        ));
    }
    preview
}

fn print_rerun_results(console: &Console, triaged: &[(PathBuf, Triage)]) {
    console.line("\n--- Rerun Results (without Devel::Cover) ---");
    for (file, kind) in triaged {
        let line = match kind {
            Triage::CoverageRelated => format!(
                "⚠ {}: PASSED without Devel::Cover (coverage-related failure)",
                file.display()
            ),
            Triage::Genuine => format!(
                "✗ {}: Still FAILED (genuine test failure)",
                file.display()
            ),
        };
        console.line(line);
    }
}
