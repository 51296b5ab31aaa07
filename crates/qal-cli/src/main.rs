//! QAL - closed-loop active learning CLI
//!
//! The `qal` command drives surrogate-guided screening runs.
//!
//! ## Commands
//!
//! - `run`: Execute an active-learning run and write its report
//! - `validate`: Check a config file without running anything
//! - `example`: Print an annotated example config
//! - `handoff validate`: Check DFT handoff packages on disk

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qal_core::{
    build_controller, prepare_run, write_aborted_report, write_run_report, AbortedReport,
    Dataset, OracleBackend, OracleKind, QalConfig, RunContext, RunReport, EXAMPLE_CONFIG,
};
use qal_handoff::{validate_handoff, write_validation_report, HandoffOracle};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "qal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Closed-loop active learning for materials screening", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the active-learning loop
    Run {
        /// Path to the TOML config
        #[arg(short, long)]
        config: PathBuf,

        /// Candidate dataset (JSON lines)
        #[arg(short, long)]
        data: PathBuf,

        /// Run identifier (default: random UUID)
        #[arg(long)]
        run_id: Option<String>,

        /// Report directory (overrides `[output] dir`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a config file
    Validate {
        /// Path to the TOML config
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print an example config
    Example,

    /// DFT handoff package operations
    Handoff {
        #[command(subcommand)]
        action: HandoffAction,
    },
}

#[derive(Subcommand)]
enum HandoffAction {
    /// Check every package under the input root against the output root
    Validate {
        #[arg(long, default_value = "handoff/inputs")]
        input_root: PathBuf,

        #[arg(long, default_value = "handoff/outputs")]
        output_root: PathBuf,

        /// Where to write the JSON summary
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    qal_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            data,
            run_id,
            output,
        } => cmd_run(&config, &data, run_id, output).await.map(|_| ()),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Example => {
            print!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
        Commands::Handoff { action } => match action {
            HandoffAction::Validate {
                input_root,
                output_root,
                report,
            } => cmd_handoff_validate(&input_root, &output_root, report.as_deref()).map(|_| ()),
        },
    }
}

async fn cmd_run(
    config_path: &Path,
    data_path: &Path,
    run_id: Option<String>,
    output: Option<PathBuf>,
) -> Result<RunReport> {
    let config = QalConfig::load(config_path)
        .with_context(|| format!("Failed to load config {:?}", config_path))?;
    let mut ctx = RunContext::new(config, run_id);
    if let Some(dir) = output {
        ctx = ctx.with_output_dir(dir);
    }

    let dataset = Dataset::load(data_path)
        .with_context(|| format!("Failed to load dataset {:?}", data_path))?;
    info!(
        candidates = dataset.candidates().len(),
        labeled = dataset.labeled_count(),
        excluded = dataset.excluded().len(),
        "dataset loaded"
    );

    let backend: Option<Arc<dyn OracleBackend>> = match ctx.config.oracle.kind {
        OracleKind::Simulated => None,
        OracleKind::Handoff => Some(Arc::new(HandoffOracle::from_config(&ctx.config.oracle))),
    };
    let run_dir = ctx.run_dir();
    let run_id = ctx.run_id.clone();
    let prepared = prepare_run(&ctx, dataset).context("Failed to prepare run")?;
    let controller = build_controller(ctx, prepared, backend).context("Failed to build loop")?;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current round");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let outcome = match controller.run().await {
        Ok(outcome) => outcome,
        Err(aborted) => {
            error!(
                phase = %aborted.phase,
                rounds = aborted.history.len(),
                "run aborted"
            );
            let partial = AbortedReport::from_aborted(&run_id, &aborted);
            match write_aborted_report(&run_dir, &partial) {
                Ok(path) => println!("Completed rounds written to {:?}", path),
                Err(err) => error!(error = %err, "failed to write aborted report"),
            }
            return Err(aborted.into());
        }
    };

    let report = RunReport::from_outcome(&outcome);
    let path = write_run_report(&run_dir, &report)?;
    println!("Run {} finished: {}", report.summary.run_id, report.summary.termination);
    println!("  Rounds:       {}", report.summary.iterations_completed);
    println!("  Labels:       {}", report.summary.cumulative_labels);
    if let Some(rmse) = report.summary.final_rmse {
        println!("  Final RMSE:   {:.4}", rmse);
    }
    println!("  Gain:         {:.3}", report.summary.label_efficiency_gain);
    if !report.outstanding_requests.is_empty() {
        println!("  Outstanding:  {}", report.outstanding_requests.len());
    }
    println!("Report written to {:?}", path);
    Ok(report)
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = QalConfig::load(config_path)
        .with_context(|| format!("Invalid config {:?}", config_path))?;
    println!("Config OK: {:?}", config_path);
    println!("  Strategy:     {}", config.run.strategy);
    println!("  Batch size:   {}", config.run.batch_size);
    println!("  Iterations:   {}", config.run.max_iterations);
    println!("  Oracle:       {:?}", config.oracle.kind);
    Ok(())
}

fn cmd_handoff_validate(
    input_root: &Path,
    output_root: &Path,
    report: Option<&Path>,
) -> Result<qal_handoff::HandoffValidationSummary> {
    let summary = validate_handoff(input_root, output_root)
        .with_context(|| format!("Failed to validate handoff under {:?}", input_root))?;
    if let Some(path) = report {
        write_validation_report(path, &summary)?;
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary)
}
