//! # net-matrix - Main Entry Point
//!
//! Runs a full throughput matrix over the given nodes and prints the report.
//!
//! ## Flow
//!
//! 1. **Parse arguments** and validate them into a `MatrixConfig`
//! 2. **Initialize logging** (colorized console, optional log file)
//! 3. **Prepare output** under `<output-dir>/<run-id>/`
//! 4. **Run the matrix**, dispatching pairs under the admission limit
//! 5. **Report**: print the summary and persist `matrix.json` / `summary.txt`
//!
//! ## Exit Codes
//!
//! `0` every pair succeeded, `1` at least one pair failed or timed out, `2`
//! configuration error, `3` internal error (incomplete matrix, output I/O),
//! `130` interrupted. The first Ctrl-C cancels the run: running pairs tear
//! down their processes and undispatched pairs are recorded as skipped.

use anyhow::{Context, Result};
use clap::Parser;
use net_matrix::{
    cli::{Args, MatrixConfig},
    context::RunContext,
    exit_codes,
    logging::init_logging,
    results::{ResultAggregator, ResultsWriter},
    scheduler::MatrixScheduler,
    utils::generate_run_id,
    OrchestratorError, VERSION,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match init_logging(args.verbose, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(exit_codes::INTERNAL_ERROR);
        }
    };

    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(args: &Args) -> Result<u8> {
    info!("Starting net-matrix {}", VERSION);
    let config = MatrixConfig::from_args(args)?;
    info!(
        "{} nodes, {} per pair, {} stream(s), launcher {}",
        config.nodes.len(),
        net_matrix::utils::format_duration(config.settings.duration),
        config.settings.parallel,
        config.launcher
    );

    let run_id = generate_run_id(&config.label);
    let writer = ResultsWriter::new(&config.output_dir, &run_id).with_context(|| {
        format!(
            "Failed to prepare output directory {}",
            config.output_dir.display()
        )
    })?;
    info!("Run {} writing to {}", run_id, writer.run_dir().display());

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let context = Arc::new(
        RunContext::new(
            run_id,
            config.max_concurrent,
            config.settings.base_port,
            ResultAggregator::new(Some(writer)),
        )
        .with_cancel_token(cancel),
    );
    let scheduler = MatrixScheduler::new(
        context,
        Arc::new(config.resolver()),
        Arc::new(config.executor()),
        config.runner.clone(),
    )
    .abort_on_first_failure(config.abort_on_first_failure)
    .record_tool_version(true);

    let report = scheduler.execute(&config.nodes, &config.settings).await?;
    println!("{}", report.render());
    Ok(report.exit_code())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, stopping running pairs and skipping the rest");
        cancel.cancel();
    }
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::Configuration(_)) => exit_codes::CONFIGURATION_ERROR,
        _ => exit_codes::INTERNAL_ERROR,
    }
}
