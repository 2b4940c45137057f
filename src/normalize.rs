//! Category re-bucketing for third-party reporting conventions.
//!
//! Modes combine by union and every mode is idempotent: absorbed categories are
//! zeroed, so a second pass adds nothing, and the SonarQube combined ratio is
//! computed only once, from the totals seen before any absorption.
use crate::report::{Ratio, Report};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationMode {
    ConditionsToBranches,
    SubroutinesToStatements,
    #[serde(rename = "sonarqube")]
    SonarQube,
    Simple,
}

impl NormalizationMode {
    pub const ALL: [NormalizationMode; 4] = [
        NormalizationMode::ConditionsToBranches,
        NormalizationMode::SubroutinesToStatements,
        NormalizationMode::SonarQube,
        NormalizationMode::Simple,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationMode::ConditionsToBranches => "conditions-to-branches",
            NormalizationMode::SubroutinesToStatements => "subroutines-to-statements",
            NormalizationMode::SonarQube => "sonarqube",
            NormalizationMode::Simple => "simple",
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormalizationMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        NormalizationMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value)
            .ok_or_else(|| {
                let valid: Vec<&str> = NormalizationMode::ALL.iter().map(|m| m.as_str()).collect();
                anyhow!(
                    "unknown normalization mode {value:?} (valid: {})",
                    valid.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizationConfig {
    modes: BTreeSet<NormalizationMode>,
}

impl NormalizationConfig {
    /// Parse a comma-separated mode list; blank input yields the empty set.
    pub fn parse(input: &str) -> Result<Self> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(NormalizationMode::from_str)
            .collect::<Result<BTreeSet<_>>>()
            .map(|modes| Self { modes })
    }

    pub fn union(&self, other: &NormalizationConfig) -> Self {
        Self {
            modes: self.modes.union(&other.modes).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn modes(&self) -> impl Iterator<Item = NormalizationMode> + '_ {
        self.modes.iter().copied()
    }

    pub fn conditions_to_branches(&self) -> bool {
        self.modes.contains(&NormalizationMode::ConditionsToBranches) || self.sonarqube()
    }

    pub fn subroutines_to_statements(&self) -> bool {
        self.modes.contains(&NormalizationMode::SubroutinesToStatements)
    }

    pub fn sonarqube(&self) -> bool {
        self.modes.contains(&NormalizationMode::SonarQube)
    }

    pub fn simple(&self) -> bool {
        self.modes.contains(&NormalizationMode::Simple)
    }
}

/// Apply the configured modes in place and refresh the summary.
pub fn normalize(report: &mut Report, config: &NormalizationConfig) {
    if config.is_empty() {
        return;
    }

    for file in report.files.values_mut() {
        if config.sonarqube() && !config.simple() && file.combined.is_none() {
            let mut combined = file.statements;
            combined.add(file.conditions);
            file.combined = Some(combined);
        }
        if config.conditions_to_branches() {
            let conditions = std::mem::take(&mut file.conditions);
            file.branches.add(conditions);
        }
        if config.subroutines_to_statements() {
            let subroutines = std::mem::take(&mut file.subroutines);
            file.statements.add(subroutines);
        }
        if config.simple() {
            file.branches = Ratio::default();
            file.conditions = Ratio::default();
            file.subroutines = Ratio::default();
            file.combined = None;
        }
    }

    let summary = &mut report.summary;
    summary.conditions_absorbed |= config.conditions_to_branches();
    summary.subroutines_absorbed |= config.subroutines_to_statements();
    summary.sonarqube |= config.sonarqube();
    summary.statements_only |= config.simple();
    report.recalculate_summary();
}
