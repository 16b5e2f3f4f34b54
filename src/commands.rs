use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::jobs::{Job, JobId, JobRegistry, JobStorage};
use crate::pipeline::{JobOutcome, PipelineController, ProgressEvent};

fn parse_id(job_id: &str) -> Result<JobId> {
    Ok(job_id.parse::<JobId>()?)
}

/// Create a job from `file` and run it with live progress.
pub fn submit(controller: &PipelineController, file: &Path) -> Result<JobOutcome> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", file.display()))?;
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let storage = controller.storage();
    let id = storage.create_job()?;
    if let Err(e) = storage.save_upload(&id, name, &bytes) {
        // Don't leave an empty job behind for a rejected upload.
        if let Err(cleanup) = storage.delete_job(&id) {
            tracing::warn!("Could not remove job {}: {}", id, cleanup);
        }
        return Err(e).with_context(|| format!("Failed to store {}", file.display()));
    }

    println!("Job {id}");
    follow(controller, &id)
}

/// Rerun the pipeline for an existing job with live progress.
pub fn run_job(controller: &PipelineController, job_id: &str) -> Result<JobOutcome> {
    let id = parse_id(job_id)?;
    follow(controller, &id)
}

fn follow(controller: &PipelineController, id: &JobId) -> Result<JobOutcome> {
    let (handle, subscription) = controller
        .start_observed(id)
        .with_context(|| format!("Failed to start job {id}"))?;

    let mut outcome = None;
    for event in subscription {
        match event {
            ProgressEvent::Line(line) => println!("{line}"),
            ProgressEvent::Done(done) => outcome = Some(done),
        }
    }
    let joined = handle.join();
    let outcome = outcome.unwrap_or(joined);

    match &outcome {
        JobOutcome::Completed => {
            println!("Job {id} completed");
            let job = controller.registry().inspect(id)?;
            print_artifacts(&job);
        }
        JobOutcome::Failed { reason } => println!("Job {id} failed: {reason}"),
    }
    Ok(outcome)
}

fn print_artifacts(job: &Job) {
    println!("  Artifacts:");
    for name in &job.artifacts {
        println!("    {}", name);
    }
}

/// List every job with its stage and artifacts.
pub fn list_jobs(controller: &PipelineController) -> Result<()> {
    let registry = controller.registry();
    let jobs = registry.list()?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    for (id, artifacts) in &jobs {
        let stage = match registry.inspect(id) {
            Ok(job) => job.stage.to_string(),
            // Deleted since listing.
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let running = if registry.is_running(id) { " (running)" } else { "" };
        let names: Vec<&str> = artifacts.iter().map(String::as_str).collect();
        println!("{id}  {stage}{running}  [{}]", names.join(", "));
    }
    Ok(())
}

pub fn show_job(controller: &PipelineController, job_id: &str) -> Result<()> {
    let id = parse_id(job_id)?;
    let registry = controller.registry();
    let job = registry.inspect(&id)?;

    println!("Job {}:", job.id);
    println!("  Directory: {}", job.dir.display());
    if let Some(created) = job.created_at {
        println!("  Created:   {}", created.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Stage:     {}", job.stage);
    println!("  Running:   {}", registry.is_running(&id));
    if let Some(reason) = &job.error_message {
        println!("  Error:     {}", reason);
    }
    print_artifacts(&job);
    Ok(())
}

/// Copy an artifact's bytes to stdout.
pub fn cat_artifact(storage: &JobStorage, job_id: &str, artifact: &str) -> Result<()> {
    let id = parse_id(job_id)?;
    let bytes = storage.read_artifact(&id, artifact)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

pub fn delete_job(controller: &PipelineController, job_id: &str) -> Result<()> {
    let id = parse_id(job_id)?;
    controller.registry().delete(&id)?;
    println!("Deleted job {id}");
    Ok(())
}

/// Remove jobs older than `days`. Zero keeps everything.
pub fn prune(controller: &PipelineController, days: u32) -> Result<()> {
    if days == 0 {
        println!("Retention is 0 days, nothing pruned");
        return Ok(());
    }
    let freed = controller.registry().prune(days)?;
    println!(
        "Pruned jobs older than {} days, freed {:.1} MB",
        days,
        freed as f64 / 1_048_576.0
    );
    Ok(())
}

/// Show storage root and usage.
pub fn show_status(registry: &JobRegistry) -> Result<()> {
    let stats = registry.stats()?;
    let total_mb = stats.bytes as f64 / 1_048_576.0;

    println!("audioscribe status:");
    println!("  Jobs dir:    {}", registry.storage().root().display());
    println!("  Total jobs:  {}", stats.jobs);
    println!("  Total files: {}", stats.files);
    println!("  Total size:  {:.1} MB", total_mb);

    Ok(())
}
