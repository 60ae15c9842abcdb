use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;
use log::{error, LevelFilter};
use thesaurus_builder::{Config, Pipeline, Stage};

/// Builds a distributional thesaurus from entry/feature instances.
#[derive(Parser)]
#[command(name = "thesaurus", version, about)]
struct Cli {
    /// More logging, repeat for trace output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less logging, repeat for errors only
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    /// Overrides the thread count of the config file
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count, all pairs and nearest neighbours
    Build { config: PathBuf },
    /// Count entries, features and events of the instances file
    Count { config: PathBuf },
    /// Filter the counts by frequency, pattern and whitelist
    Filter { config: PathBuf },
    /// Similarity of every pair of counted entries
    Allpairs { config: PathBuf },
    /// Nearest neighbours of every entry from the similarity file
    Knn { config: PathBuf },
    /// Sort a weighted pairs file
    Sort { config: PathBuf },
}

fn init_logging(verbose: u8, quiet: u8) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    let level = match (quiet, verbose) {
        (0, 0) => None,
        (1, _) => Some(LevelFilter::Warn),
        (q, _) if q > 1 => Some(LevelFilter::Error),
        (_, 1) => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    };
    if let Some(level) = level {
        builder.filter_level(level);
    }
    let _ = builder.try_init();
}

fn run(cli: Cli) -> thesaurus_builder::Result<()> {
    let (stage, path) = match cli.command {
        Command::Build { config } => (Stage::Build, config),
        Command::Count { config } => (Stage::Count, config),
        Command::Filter { config } => (Stage::Filter, config),
        Command::Allpairs { config } => (Stage::AllPairs, config),
        Command::Knn { config } => (Stage::Knn, config),
        Command::Sort { config } => (Stage::Sort, config),
    };
    let mut config = Config::from_file(&path)?;
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    Pipeline::new(config)?.run(stage)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
