//! brainlm-rs CLI: layer-wise brain encoding analysis

use anyhow::{bail, Context, Result};
use brainlm_rs::{compare_tables, Pipeline, PipelineConfig, ResultsTable};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "brainlm-rs")]
#[command(about = "Layer-wise encoding of fMRI responses from language model hidden states")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the encoding analysis for every configured condition
    Encode {
        /// JSON configuration file (omitted fields take defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the data root directory
        #[arg(long)]
        base_dir: Option<PathBuf>,

        /// Comma-separated run numbers (e.g. "15,16,17")
        #[arg(long, value_delimiter = ',')]
        runs: Option<Vec<u32>>,

        /// Only analyze the named condition(s)
        #[arg(long = "condition")]
        conditions: Vec<String>,

        /// Keep runs already present in existing results files
        #[arg(long)]
        resume: bool,
    },

    /// Compare two conditions' results tables layer by layer
    Compare {
        /// Results CSV of the base model
        #[arg(long)]
        base: PathBuf,

        /// Results CSV of the instruction-tuned model
        #[arg(long)]
        instruct: PathBuf,

        /// Write the comparison as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Encode {
            config,
            base_dir,
            runs,
            conditions,
            resume,
        } => encode(config, base_dir, runs, &conditions, resume),
        Command::Compare {
            base,
            instruct,
            output,
        } => compare(&base, &instruct, output),
    }
}

fn encode(
    config_path: Option<PathBuf>,
    base_dir: Option<PathBuf>,
    runs: Option<Vec<u32>>,
    selected: &[String],
    resume: bool,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(base_dir) = base_dir {
        config.data.base_dir = base_dir;
    }
    if let Some(runs) = runs {
        config.data.runs = runs;
    }
    if !selected.is_empty() {
        config.conditions.retain(|c| selected.contains(&c.name));
        if config.conditions.is_empty() {
            bail!("No configured condition matches {:?}", selected);
        }
    }

    // Fail before any run is processed if a condition has no features
    for condition in &config.conditions {
        let dir = config.data.feature_path(condition);
        if !dir.is_dir() {
            bail!(
                "Embedding directory {} for condition {} does not exist",
                dir.display(),
                condition.name
            );
        }
    }

    println!("=== brainlm-rs: layer-wise brain encoding ===");
    println!("Data:    {}", config.data.base_dir.display());
    println!("Runs:    {:?}", config.data.runs);
    println!("Results: {}", config.data.results_path().display());

    let conditions = config.conditions.clone();
    let pipeline = Pipeline::from_config(config)?;

    for condition in &conditions {
        let summary = pipeline
            .run_condition(condition, resume)
            .with_context(|| format!("Condition {} failed", condition.name))?;

        println!("\n=== {} ===", summary.condition);
        for report in &summary.reports {
            match report.best_layer() {
                Some(best) => println!(
                    "{}: delay {:.0}s, {} sentences, best layer {} (r = {:.4})",
                    report.run, report.delay, report.n_sentences, best.layer, best.mean
                ),
                None => println!("{}: delay {:.0}s, no layers", report.run, report.delay),
            }
        }
        for (run, reason) in &summary.skipped {
            println!("Run{run}: skipped ({reason})");
        }
        info!(
            "{} runs saved to {}",
            summary.table.n_runs(),
            summary.results_path.display()
        );
    }

    Ok(())
}

fn compare(base: &Path, instruct: &Path, output: Option<PathBuf>) -> Result<()> {
    let base_table = ResultsTable::read_csv(base)
        .with_context(|| format!("Failed to read {}", base.display()))?;
    let instruct_table = ResultsTable::read_csv(instruct)
        .with_context(|| format!("Failed to read {}", instruct.display()))?;

    let comparison = compare_tables(&base_table, &instruct_table);
    println!("\n=== Base vs Instruct ===");
    comparison.print_table();

    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&comparison)?)?;
        info!("Comparison saved to {}", path.display());
    }

    Ok(())
}
