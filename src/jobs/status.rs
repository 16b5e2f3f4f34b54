use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::JobResult;

/// Where a job is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Created,
    Converting,
    Transcribing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Converting => write!(f, "converting"),
            Self::Transcribing => write!(f, "transcribing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status record stored as a hidden file in each job directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub stage: JobStage,
    /// RFC 3339 timestamp of the last update.
    pub updated_at: String,
    /// Failure reason (if stage == Failed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub const STATUS_FILE_NAME: &str = ".job.json";
const STATUS_TMP_NAME: &str = ".job.json.tmp";

impl JobStatus {
    pub fn new(stage: JobStage) -> Self {
        Self {
            stage,
            updated_at: chrono::Local::now().to_rfc3339(),
            error_message: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::new(JobStage::Failed)
        }
    }

    /// Write the status into `job_dir`.
    pub fn write(&self, job_dir: &Path) -> JobResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        // Write to temp then rename so readers never see a half-written file.
        let tmp_path = job_dir.join(STATUS_TMP_NAME);
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, job_dir.join(STATUS_FILE_NAME))?;
        Ok(())
    }

    /// Read the status from `job_dir`. Returns `None` if the file doesn't exist
    /// or can't be parsed.
    pub fn read(job_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(job_dir.join(STATUS_FILE_NAME)).ok()?;
        serde_json::from_str(&content).ok()
    }
}
