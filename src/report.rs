//! Aggregated coverage report and its renderers.
//!
//! Percentages are derived on demand from `{covered, total}` pairs. A pair with
//! `total == 0` has no percentage ("n/a"), and summaries pool the raw sums
//! across files instead of averaging per-file percentages.
use crate::util::truncate_path_front;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

const PATH_WIDTH: usize = 60;
const COLUMN_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ratio {
    pub covered: u64,
    pub total: u64,
}

impl Ratio {
    pub fn new(covered: u64, total: u64) -> Self {
        Self { covered, total }
    }

    pub fn percent(&self) -> Option<f64> {
        percent(self.covered, self.total)
    }

    pub fn add(&mut self, other: Ratio) {
        self.covered += other.covered;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileCoverage {
    pub path: String,
    pub statements: Ratio,
    pub branches: Ratio,
    pub conditions: Ratio,
    pub subroutines: Ratio,
    /// SonarQube-style statements + conditions ratio, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined: Option<Ratio>,
    pub uncovered_lines: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub statement: Option<f64>,
    pub branch: Option<f64>,
    pub condition: Option<f64>,
    pub subroutine: Option<f64>,
    pub combined: Option<f64>,
    pub total_files: usize,
    pub covered_files: usize,
    pub conditions_absorbed: bool,
    pub subroutines_absorbed: bool,
    pub statements_only: bool,
    pub sonarqube: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub files: BTreeMap<String, FileCoverage>,
    pub summary: CoverageSummary,
}

pub fn percent(covered: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(covered as f64 / total as f64 * 100.0)
}

impl Report {
    pub fn from_files(files: BTreeMap<String, FileCoverage>) -> Self {
        let mut report = Report {
            files,
            summary: CoverageSummary::default(),
        };
        report.recalculate_summary();
        report
    }

    /// Recompute pooled percentages, keeping the absorption flags.
    pub fn recalculate_summary(&mut self) {
        let mut statements = Ratio::default();
        let mut branches = Ratio::default();
        let mut conditions = Ratio::default();
        let mut subroutines = Ratio::default();
        let mut combined: Option<Ratio> = None;
        let mut covered_files = 0;

        for file in self.files.values() {
            statements.add(file.statements);
            branches.add(file.branches);
            conditions.add(file.conditions);
            subroutines.add(file.subroutines);
            if let Some(ratio) = file.combined {
                combined.get_or_insert_with(Ratio::default).add(ratio);
            }
            if file.statements.covered > 0 {
                covered_files += 1;
            }
        }

        let summary = &mut self.summary;
        summary.statement = statements.percent();
        summary.branch = branches.percent();
        summary.condition = conditions.percent();
        summary.subroutine = subroutines.percent();
        summary.combined = combined.and_then(|ratio| ratio.percent());
        summary.total_files = self.files.len();
        summary.covered_files = covered_files;
    }
}

pub fn format_ratio(ratio: Ratio) -> String {
    format_percent(ratio.percent())
}

pub fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.1}%"),
        None => "n/a".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Statement,
    Branch,
    Condition,
    Subroutine,
    Combined,
}

impl Column {
    fn header(self) -> &'static str {
        match self {
            Column::Statement => "Stmt",
            Column::Branch => "Branch",
            Column::Condition => "Cond",
            Column::Subroutine => "Sub",
            Column::Combined => "Combined",
        }
    }

    fn file_value(self, file: &FileCoverage) -> String {
        match self {
            Column::Statement => format_ratio(file.statements),
            Column::Branch => format_ratio(file.branches),
            Column::Condition => format_ratio(file.conditions),
            Column::Subroutine => format_ratio(file.subroutines),
            Column::Combined => format_percent(file.combined.and_then(|r| r.percent())),
        }
    }

    fn summary_value(self, summary: &CoverageSummary) -> Option<f64> {
        match self {
            Column::Statement => summary.statement,
            Column::Branch => summary.branch,
            Column::Condition => summary.condition,
            Column::Subroutine => summary.subroutine,
            Column::Combined => summary.combined,
        }
    }
}

/// Columns still meaningful after normalization.
fn visible_columns(summary: &CoverageSummary) -> Vec<Column> {
    let mut columns = vec![Column::Statement];
    if summary.statements_only {
        return columns;
    }
    columns.push(Column::Branch);
    if !summary.conditions_absorbed {
        columns.push(Column::Condition);
    }
    if !summary.subroutines_absorbed {
        columns.push(Column::Subroutine);
    }
    if summary.sonarqube {
        columns.push(Column::Combined);
    }
    columns
}

/// Render the fixed-width table printed after a run.
pub fn render_table(report: &Report, verbose: bool) -> String {
    let columns = visible_columns(&report.summary);
    let width = PATH_WIDTH + columns.len() * (COLUMN_WIDTH + 1);
    let mut out = String::new();

    let _ = write!(out, "\n{:<PATH_WIDTH$}", "File");
    for column in &columns {
        let _ = write!(out, " {:>COLUMN_WIDTH$}", column.header());
    }
    out.push('\n');
    out.push_str(&"-".repeat(width));
    out.push('\n');

    for (path, file) in &report.files {
        let display = truncate_path_front(path, PATH_WIDTH - 2);
        let _ = write!(out, "{display:<PATH_WIDTH$}");
        for column in &columns {
            let _ = write!(out, " {:>COLUMN_WIDTH$}", column.file_value(file));
        }
        out.push('\n');
        if verbose && !file.uncovered_lines.is_empty() {
            let lines: Vec<String> = file.uncovered_lines.iter().map(u32::to_string).collect();
            let _ = writeln!(out, "    Uncovered lines: {}", lines.join(", "));
        }
    }

    out.push_str(&"-".repeat(width));
    out.push('\n');
    let _ = write!(out, "{:<PATH_WIDTH$}", "Total");
    for column in &columns {
        let value = format_percent(column.summary_value(&report.summary));
        let _ = write!(out, " {value:>COLUMN_WIDTH$}");
    }
    out.push('\n');
    out
}
