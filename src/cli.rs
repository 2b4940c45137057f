//! CLI argument parsing.
//!
//! Every flag is optional; unset values fall through to `perlcov.json`, the
//! environment, and built-in defaults (see [`crate::config`]).
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "perlcov",
    version,
    about = "Run Perl tests in parallel under Devel::Cover and report merged coverage",
    after_help = "Normalization modes:\n  conditions-to-branches     fold condition coverage into branches\n  subroutines-to-statements  fold subroutine coverage into statements\n  sonarqube                  conditions into branches plus a combined ratio\n  simple                     statements only\n\nExamples:\n  perlcov\n  perlcov -j 8 t/unit t/integration\n  perlcov --normalize sonarqube --json-merge\n  perlcov -I local/lib/perl5 --html"
)]
pub struct Cli {
    /// Test files or directories searched recursively for *.t
    #[arg(value_name = "PATHS")]
    pub paths: Vec<PathBuf>,

    /// Add a directory to the interpreter's include path
    #[arg(short = 'I', value_name = "DIR")]
    pub include: Vec<PathBuf>,

    /// Number of tests to run concurrently
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Source root whose modules are instrumented (default: lib)
    #[arg(long = "source", value_name = "DIR")]
    pub source: Vec<PathBuf>,

    /// Exclude files under this directory from instrumentation
    #[arg(long = "ignore", value_name = "DIR")]
    pub ignore: Vec<String>,

    /// Final coverage database directory (default: cover_db)
    #[arg(long, value_name = "DIR")]
    pub cover_dir: Option<PathBuf>,

    /// Directory the coverage database is written under
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Comma-separated normalization modes
    #[arg(long, value_name = "MODES")]
    pub normalize: Option<String>,

    /// Convert every run to JSON and merge in-process
    #[arg(long)]
    pub json_merge: bool,

    /// Instrument all source roots instead of the module a test targets
    #[arg(long)]
    pub no_select: bool,

    /// Do not rerun failed tests without instrumentation
    #[arg(long)]
    pub no_rerun_failed: bool,

    /// Kill a test after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Also render the HTML report with `cover -report html`
    #[arg(long)]
    pub html: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Stream test output while it is captured
    #[arg(long)]
    pub show_output: bool,

    /// Keep per-test database directories after consolidation
    #[arg(long)]
    pub keep_isolated: bool,

    /// Perl interpreter to run tests with
    #[arg(long, value_name = "PATH")]
    pub perl_path: Option<PathBuf>,

    /// Project config file (default: ./perlcov.json when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// List uncovered lines and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeatable_and_short_flags() {
        let cli = Cli::try_parse_from([
            "perlcov",
            "-I",
            "local/lib",
            "-I",
            "vendor",
            "-j",
            "4",
            "--source",
            "lib",
            "--source",
            "blib",
            "--normalize",
            "sonarqube,simple",
            "--no-select",
            "t/unit",
        ])
        .expect("parse");
        assert_eq!(cli.include, vec![PathBuf::from("local/lib"), PathBuf::from("vendor")]);
        assert_eq!(cli.jobs, Some(4));
        assert_eq!(cli.source.len(), 2);
        assert_eq!(cli.normalize.as_deref(), Some("sonarqube,simple"));
        assert!(cli.no_select);
        assert!(!cli.json_merge);
        assert_eq!(cli.paths, vec![PathBuf::from("t/unit")]);
    }
}
