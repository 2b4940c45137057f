use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod db;
mod discover;
mod format;
mod merge;
mod normalize;
mod pool;
mod record;
mod report;
mod runner;
mod scope;
mod structure;
mod tool;
mod util;
mod workflow;

fn init_tracing(verbose: bool) {
    let default = if verbose { "perlcov=debug" } else { "perlcov=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.verbose);

    let cwd = std::env::current_dir().context("resolve working directory")?;
    let config = config::Config::resolve(cli, cwd)?;
    tracing::debug!(
        jobs = config.jobs,
        cover_dir = %config.cover_dir.display(),
        perl = %config.perl_path.display(),
        "resolved configuration"
    );

    let outcome = workflow::run(&config)?;
    tracing::debug!(
        runs = outcome.merge.runs_merged,
        files = outcome.report.files.len(),
        "coverage run finished"
    );
    if !outcome.success() {
        eprintln!("{} test(s) failed", outcome.tests.failed);
        std::process::exit(1);
    }
    Ok(())
}
