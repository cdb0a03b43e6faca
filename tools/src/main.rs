//! stockpost-runner: headless runner for the postprocessing pipeline.
//!
//! Usage:
//!   stockpost-runner --config pipeline.json
//!   stockpost-runner --config pipeline.json --plan export_plan.json --db ledger.db
//!
//! Exit codes: 0 on success, otherwise the failing error kind's code.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use stockpost_core::{
    config::{ExportPlan, PipelineConfig},
    engine::{PipelineEngine, RunSummary},
    error::PipelineError,
    store::RunLedger,
};

#[derive(Debug, Parser)]
#[command(name = "stockpost-runner", version, about = "Run the stock postprocessing pipeline")]
struct Args {
    /// Pipeline configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Export plan (JSON); replaces the plan embedded in the config.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Run ledger database. Defaults to an in-memory ledger.
    #[arg(long, default_value = ":memory:")]
    db: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = match err.downcast_ref::<PipelineError>() {
                Some(pipeline) => {
                    log::error!("{} failed: {pipeline}", pipeline.kind().name());
                    pipeline.kind().exit_code()
                }
                None => {
                    log::error!("{err:#}");
                    1
                }
            };
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(args: &Args) -> Result<RunSummary> {
    let mut config = PipelineConfig::load(&args.config)?;
    if let Some(plan) = &args.plan {
        config.export.plan = ExportPlan::load(plan)?;
    }

    println!("stockpost-runner");
    println!("  dataset:   {}", config.dataset);
    println!("  seed:      {}", config.seed);
    println!("  upgrades:  {:?}", config.upgrade_ids);
    println!("  output:    {}", config.output_dir.display());
    println!("  db:        {}", args.db);
    println!();

    let ledger = if args.db == ":memory:" {
        RunLedger::in_memory()?
    } else {
        RunLedger::open(&args.db)?
    };
    ledger.migrate()?;

    let mut engine = PipelineEngine::build(config, ledger)?;
    let summary = engine.run()?;
    let counts = engine.ledger().counts(&summary.run_id)?;
    log::info!(
        "Ledger: {} event(s), {} failure summary row(s), {} shortfall row(s)",
        counts.events,
        counts.failure_summaries,
        counts.shortfalls
    );
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} complete", summary.run_id);
    for s in &summary.failure_summaries {
        println!(
            "  upgrade {:>2}  {:<40} {:>6} rows  {:>5.2}% failed",
            s.upgrade_id,
            s.upgrade_name,
            s.total,
            s.fraction_fail * 100.0
        );
    }
    if !summary.shortfalls.is_empty() {
        println!("  apportionment shortfalls: {}", summary.shortfalls.len());
    }
    for f in &summary.scaling_factors {
        println!("  rescale {:<30} x{:.3}", f.building_type, f.factor);
    }
    println!("  files written: {}", summary.files.len());
    for path in &summary.dictionaries {
        println!("  dictionary:    {}", path.display());
    }
}
