mod cli;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use audioscribe::commands;
use audioscribe::config::{Config, FailurePolicy};
use audioscribe::pipeline::{JobOutcome, PipelineController};
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries progress lines and artifact bytes.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audioscribe=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    if let Commands::InitConfig = cli.command {
        print!("{}", Config::generate_default_commented());
        return Ok(());
    }

    let (mut config, config_path) = Config::load_with_path(cli.config.as_deref())?;
    if let Some(path) = &config_path {
        tracing::debug!("Using config {}", path.display());
    }
    if let Commands::Submit { strict: true, .. } = cli.command {
        config.pipeline.failure_policy = FailurePolicy::Strict;
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let interrupt_ctrlc = interrupt.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, cancelling");
        interrupt_ctrlc.store(true, Ordering::Relaxed);
    })?;

    let controller = PipelineController::from_config(&config).with_interrupt(interrupt);

    match cli.command {
        Commands::Submit { file, .. } => exit_on_failure(commands::submit(&controller, &file)?),
        Commands::Run { job_id } => exit_on_failure(commands::run_job(&controller, &job_id)?),
        Commands::List => commands::list_jobs(&controller),
        Commands::Show { job_id } => commands::show_job(&controller, &job_id),
        Commands::Cat { job_id, artifact } => {
            commands::cat_artifact(controller.storage(), &job_id, &artifact)
        }
        Commands::Delete { job_id } => commands::delete_job(&controller, &job_id),
        Commands::Prune { days } => {
            commands::prune(&controller, days.unwrap_or(config.storage.retention_days))
        }
        Commands::Status => commands::show_status(controller.registry()),
        Commands::InitConfig => Ok(()),
    }
}

fn exit_on_failure(outcome: JobOutcome) -> anyhow::Result<()> {
    if outcome.is_completed() {
        Ok(())
    } else {
        std::process::exit(1)
    }
}
