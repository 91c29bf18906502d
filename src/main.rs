//! # Pipe Transfer Benchmark - Main Entry Point
//!
//! 1. **Initialize logging**: colored console output, optional log file
//! 2. **Parse arguments**: sizes, strategies, placement and output paths
//! 3. **Dispatch**: list the configuration space, re-aggregate an existing
//!    raw dataset, or run a full measurement session
//!
//! A session runs one producer/consumer pair at a time. The first failed run
//! aborts it; samples measured before the failure remain in the raw dataset.

use anyhow::Result;
use clap::Parser;
use pipe_bench::{
    affinity::validate_placement,
    cli::Args,
    logging::init_logging,
    runner::{PipeRunner, RunnerConfig},
    session::{print_configuration_space, reaggregate, Session, SessionSettings},
};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting pipe benchmark v{}", pipe_bench::VERSION);
    debug!("Arguments: {:?}", args);

    if let Some(raw_dataset) = &args.aggregate_only {
        reaggregate(
            raw_dataset,
            &args.aggregated_output,
            args.summary_output.as_deref(),
        )?;
        return Ok(());
    }

    let settings = SessionSettings::from_args(&args)?;

    if args.list {
        print_configuration_space(&settings.space.generate());
        return Ok(());
    }

    validate_placement(args.producer_cpu, args.consumer_cpu)?;
    let runner = PipeRunner::new(RunnerConfig::from_args(&args));
    let mut session = Session::new(settings, runner)?;

    if let Err(e) = session.run().await {
        error!("{:#}", e);
        let dataset = session.into_raw_dataset()?;
        info!(
            "Partial raw dataset kept ({} samples); re-run with --aggregate-only to aggregate it",
            dataset.len()
        );
        return Err(e);
    }

    let report = session.finalize()?;
    info!(
        "Pipe benchmark completed: {} samples, {} aggregated rows",
        report.metadata.samples,
        report.rows.len()
    );
    Ok(())
}
