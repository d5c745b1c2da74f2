//! Command-line entry point for the business combination law replication.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use bcrisk::{PipelineConfig, logging, run};
use clap::Parser;

#[derive(Parser)]
#[command(name = "bcrisk")]
#[command(about = "Replicate business combination law effects on firm risk", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the Compustat, CRSP and CCM extracts
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write the fitted regressions to this JSON file
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    if let Err(error) = execute() {
        eprintln!("Error: {error:#}");
        process::exit(1);
    }
}

fn execute() -> bcrisk::Result<()> {
    logging::init_logging()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let results = run(&config)?;
    for result in &results {
        println!("{}\n", result.fit);
    }

    if let Some(output) = cli.output {
        let serialized = serde_json::to_string_pretty(&results)?;
        fs::write(&output, serialized)
            .with_context(|| format!("writing results to {}", output.display()))?;
    }

    Ok(())
}
