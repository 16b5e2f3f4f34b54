use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "audioscribe",
    version,
    about = "Job-based audio transcription through external normalize and transcribe tools"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job from an audio file and transcribe it
    Submit {
        /// Audio file to transcribe
        file: PathBuf,

        /// Fail the job if audio conversion fails
        #[arg(long)]
        strict: bool,
    },

    /// Run the pipeline again for an existing job
    Run {
        job_id: String,
    },

    /// List all jobs with their stage and artifacts
    List,

    /// Show one job in detail
    Show {
        job_id: String,
    },

    /// Write an artifact's bytes to stdout
    Cat {
        job_id: String,
        artifact: String,
    },

    /// Delete a job and all its files
    Delete {
        job_id: String,
    },

    /// Remove jobs older than the retention period
    Prune {
        /// Retention in days (defaults to storage.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show storage root, job count and disk usage
    Status,

    /// Print a commented default config file
    InitConfig,
}
