use teamfuzz_core::config::CampaignConfig;
use teamfuzz_core::executor::ProcessLauncher;
use teamfuzz_core::partition::Strategy;
use teamfuzz_core::profiler::CommandProfiler;
use teamfuzz_core::scheduler::{CampaignInputs, CampaignScheduler, SleepPacer, preflight};

use anyhow::Context;
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Distributed fuzzing campaign manager", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, default_value = "campaign.toml")]
    config_file: PathBuf,
    /// Total fleet size, monitor included.
    #[clap(short, long)]
    workers: Option<usize>,
    /// Partitioning strategy: "tree" or "naive".
    #[clap(short, long)]
    algorithm: Option<Strategy>,
    #[clap(short, long)]
    out_dir: Option<PathBuf>,
    /// Write log records to this file instead of stderr.
    #[clap(long)]
    log_file: Option<PathBuf>,
    /// Validate config and inputs, print the plan and exit.
    #[clap(long)]
    check: bool,
}

fn init_logging(log_file: Option<&Path>) -> Result<(), anyhow::Error> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = CampaignConfig::load_from_file(&cli.config_file)
        .with_context(|| format!("Loading campaign from {}", cli.config_file.display()))?;

    if let Some(workers) = cli.workers {
        config.campaign.worker_count = workers;
    }
    if let Some(algorithm) = cli.algorithm {
        config.campaign.algorithm = algorithm;
    }
    if let Some(out_dir) = cli.out_dir {
        config.campaign.out_dir = out_dir;
    }
    let log_file = cli.log_file.or_else(|| config.campaign.log_file.clone());
    init_logging(log_file.as_deref())?;
    log::debug!("Effective configuration: {config:#?}");

    if cli.check {
        let report = preflight(&config).context("Preflight check failed")?;
        println!("{report}");
        return Ok(());
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install interrupt handler")?;

    let inputs = CampaignInputs::load(&config).context("Failed to load campaign inputs")?;
    let profiler = CommandProfiler::new(config.profiler_config());
    let scheduler = CampaignScheduler::new(
        config,
        inputs,
        Box::new(ProcessLauncher),
        Box::new(profiler),
        Box::new(SleepPacer::new(interrupted)),
    )?;
    log::info!("Starting campaign with {} round(s)", scheduler.total_rounds());

    let summary = scheduler.run().context("Campaign failed")?;
    println!("{summary}");
    Ok(())
}
