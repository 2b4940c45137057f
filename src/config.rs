//! Resolved run configuration.
//!
//! Each field resolves as CLI flag, then project config file, then
//! environment, then built-in default. Everything is validated here, before
//! any test runs.
use crate::cli::Cli;
use crate::normalize::NormalizationConfig;
use crate::util::absolutize;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROJECT_CONFIG_FILE: &str = "perlcov.json";
pub const PERL_PATH_ENV: &str = "PERL_PATH";
pub const PERL_SWITCHES_ENV: &str = "HARNESS_PERL_SWITCHES";

const DEFAULT_COVER_DIR: &str = "cover_db";
const DEFAULT_SOURCE_ROOT: &str = "lib";
const DEFAULT_TEST_PATH: &str = "t";

/// Optional `perlcov.json` checked into a project.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub jobs: Option<usize>,
    pub include: Vec<PathBuf>,
    pub source: Vec<PathBuf>,
    pub ignore: Vec<String>,
    pub cover_dir: Option<PathBuf>,
    pub normalize: Vec<String>,
    pub json_merge: bool,
    pub no_select: bool,
    pub no_rerun_failed: bool,
    pub timeout_seconds: Option<u64>,
    pub perl_path: Option<PathBuf>,
}

impl ProjectConfig {
    /// Load an explicit config path, or `perlcov.json` in `cwd` when present.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => absolutize(path, cwd),
            None => {
                let default = cwd.join(PROJECT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let config: ProjectConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded project config");
        Ok(config)
    }

    fn normalization(&self) -> Result<NormalizationConfig> {
        self.normalize
            .iter()
            .try_fold(NormalizationConfig::default(), |acc, entry| {
                Ok(acc.union(&NormalizationConfig::parse(entry)?))
            })
    }
}

/// Process environment inputs, captured once so resolution stays testable.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub perl_path: Option<PathBuf>,
    pub perl_switches: Option<String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            perl_path: std::env::var_os(PERL_PATH_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            perl_switches: std::env::var(PERL_SWITCHES_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cwd: PathBuf,
    pub test_paths: Vec<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub source_roots: Vec<PathBuf>,
    pub ignore_dirs: Vec<String>,
    /// Absolute path of the final database directory.
    pub cover_dir: PathBuf,
    pub jobs: usize,
    pub normalization: NormalizationConfig,
    pub json_merge: bool,
    pub no_select: bool,
    pub no_rerun_failed: bool,
    pub keep_isolated: bool,
    pub timeout: Option<Duration>,
    pub show_output: bool,
    pub html: bool,
    pub json: bool,
    pub verbose: bool,
    pub perl_path: PathBuf,
    pub perl_switches: Vec<String>,
}

impl Config {
    pub fn resolve(cli: Cli, cwd: PathBuf) -> Result<Self> {
        let project = ProjectConfig::load(cli.config.as_deref(), &cwd)?;
        Self::resolve_with(cli, project, Environment::from_process(), cwd)
    }

    pub fn resolve_with(
        cli: Cli,
        project: ProjectConfig,
        env: Environment,
        cwd: PathBuf,
    ) -> Result<Self> {
        let jobs = cli.jobs.or(project.jobs).unwrap_or_else(default_jobs);
        if jobs == 0 {
            return Err(anyhow!("--jobs must be at least 1"));
        }

        let normalization = match cli.normalize.as_deref() {
            Some(modes) => NormalizationConfig::parse(modes),
            None => project.normalization(),
        }
        .context("invalid --normalize value")?;

        let timeout_secs = cli.timeout.or(project.timeout_seconds);
        if timeout_secs == Some(0) {
            return Err(anyhow!("--timeout must be greater than 0"));
        }

        let perl_path = cli
            .perl_path
            .or(project.perl_path)
            .or(env.perl_path)
            .unwrap_or_else(default_perl);
        let perl_switches = match env.perl_switches.as_deref() {
            Some(switches) => shell_words::split(switches)
                .with_context(|| format!("parse {PERL_SWITCHES_ENV}"))?,
            None => Vec::new(),
        };

        let source_roots = first_non_empty(cli.source, project.source)
            .unwrap_or_else(|| vec![PathBuf::from(DEFAULT_SOURCE_ROOT)]);
        let test_paths = if cli.paths.is_empty() {
            vec![PathBuf::from(DEFAULT_TEST_PATH)]
        } else {
            cli.paths
        };
        let output_dir = cli.output_dir.unwrap_or_else(|| PathBuf::from("."));
        let cover_dir = cli
            .cover_dir
            .or(project.cover_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COVER_DIR));
        let output_root = if output_dir == Path::new(".") {
            cwd.clone()
        } else {
            absolutize(&output_dir, &cwd)
        };
        let cover_dir = absolutize(&cover_dir, &output_root);

        let mut include_paths = project.include;
        include_paths.extend(cli.include);
        let mut ignore_dirs = project.ignore;
        ignore_dirs.extend(cli.ignore);

        Ok(Self {
            cwd,
            test_paths,
            include_paths,
            source_roots,
            ignore_dirs,
            cover_dir,
            jobs,
            normalization,
            json_merge: cli.json_merge || project.json_merge,
            no_select: cli.no_select || project.no_select,
            no_rerun_failed: cli.no_rerun_failed || project.no_rerun_failed,
            keep_isolated: cli.keep_isolated,
            timeout: timeout_secs.map(Duration::from_secs),
            show_output: cli.show_output,
            html: cli.html,
            json: cli.json,
            verbose: cli.verbose,
            perl_path,
            perl_switches,
        })
    }
}

fn first_non_empty<T>(preferred: Vec<T>, fallback: Vec<T>) -> Option<Vec<T>> {
    if !preferred.is_empty() {
        Some(preferred)
    } else if !fallback.is_empty() {
        Some(fallback)
    } else {
        None
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_perl() -> PathBuf {
    which::which("perl").unwrap_or_else(|_| PathBuf::from("perl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizationMode;
    use clap::Parser;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["perlcov"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse cli")
    }

    fn resolve(args: &[&str], project: ProjectConfig, env: Environment) -> Result<Config> {
        Config::resolve_with(cli(args), project, env, PathBuf::from("/work/project"))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let env = Environment {
            perl_path: Some(PathBuf::from("/opt/perl/bin/perl")),
            perl_switches: None,
        };
        let config = resolve(&[], ProjectConfig::default(), env).expect("resolve");
        assert!(config.jobs >= 1);
        assert_eq!(config.source_roots, vec![PathBuf::from("lib")]);
        assert_eq!(config.test_paths, vec![PathBuf::from("t")]);
        assert_eq!(config.cover_dir, PathBuf::from("/work/project/cover_db"));
        assert_eq!(config.perl_path, PathBuf::from("/opt/perl/bin/perl"));
        assert!(config.normalization.is_empty());
        assert!(config.timeout.is_none());
    }

    #[test]
    fn cli_overrides_project_which_overrides_env() {
        let project = ProjectConfig {
            jobs: Some(3),
            perl_path: Some(PathBuf::from("/project/perl")),
            source: vec![PathBuf::from("src")],
            normalize: vec!["simple".to_string()],
            timeout_seconds: Some(30),
            ..ProjectConfig::default()
        };
        let env = Environment {
            perl_path: Some(PathBuf::from("/env/perl")),
            perl_switches: Some("-w -Mstrict".to_string()),
        };
        let config = resolve(
            &["-j", "8", "--normalize", "sonarqube"],
            project.clone(),
            env.clone(),
        )
        .expect("resolve");
        assert_eq!(config.jobs, 8);
        assert_eq!(config.perl_path, PathBuf::from("/project/perl"));
        assert_eq!(config.source_roots, vec![PathBuf::from("src")]);
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.normalization.modes().collect::<Vec<_>>(),
            vec![NormalizationMode::SonarQube]
        );
        assert_eq!(config.perl_switches, vec!["-w", "-Mstrict"]);

        let config = resolve(&[], project, env).expect("resolve");
        assert!(config.normalization.simple());
    }

    #[test]
    fn cover_dir_lives_under_output_dir() {
        let config = resolve(
            &["-o", "/tmp/out", "--cover-dir", "db"],
            ProjectConfig::default(),
            Environment::default(),
        )
        .expect("resolve");
        assert_eq!(config.cover_dir, PathBuf::from("/tmp/out/db"));
    }

    #[test]
    fn rejects_invalid_values_before_running() {
        let err = resolve(&["--normalize", "bogus"], ProjectConfig::default(), Environment::default())
            .expect_err("bad mode");
        assert!(format!("{err:#}").contains("unknown normalization mode"));

        assert!(resolve(&["-j", "0"], ProjectConfig::default(), Environment::default()).is_err());
        assert!(resolve(&["--timeout", "0"], ProjectConfig::default(), Environment::default()).is_err());
    }

    #[test]
    fn project_modes_combine_by_union() {
        let project = ProjectConfig {
            normalize: vec![
                "conditions-to-branches".to_string(),
                "subroutines-to-statements, conditions-to-branches".to_string(),
            ],
            ..ProjectConfig::default()
        };
        let modes = project.normalization().expect("modes");
        assert!(modes.conditions_to_branches());
        assert!(modes.subroutines_to_statements());
        assert_eq!(modes.modes().count(), 2);
    }

    #[test]
    fn project_file_rejects_unknown_fields() {
        let tmp = TempDir::new().expect("tempdir");
        fs::write(tmp.path().join(PROJECT_CONFIG_FILE), r#"{"jobz": 2}"#).expect("write");
        assert!(ProjectConfig::load(None, tmp.path()).is_err());

        fs::write(
            tmp.path().join(PROJECT_CONFIG_FILE),
            r#"{"jobs": 2, "include": ["local/lib/perl5"], "json_merge": true}"#,
        )
        .expect("write");
        let project = ProjectConfig::load(None, tmp.path()).expect("load");
        assert_eq!(project.jobs, Some(2));
        assert!(project.json_merge);
    }

    #[test]
    fn missing_default_project_file_is_fine() {
        let tmp = TempDir::new().expect("tempdir");
        let project = ProjectConfig::load(None, tmp.path()).expect("load");
        assert!(project.jobs.is_none());
        assert!(ProjectConfig::load(Some(Path::new("nope.json")), tmp.path()).is_err());
    }
}
