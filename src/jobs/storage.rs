// On-disk job storage: one directory per job under a shared root.
//
// Layout: <root>/<job_id>/{<upload>, input.wav, output.txt, output.srt, stdout.log, .job.json}
// Names starting with '.' are internal and never exposed as artifacts.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, Local};

use crate::config::Config;
use crate::error::{JobError, JobResult};
use crate::jobs::id::JobId;
use crate::jobs::status::{JobStage, JobStatus};

pub const OUTPUT_TXT: &str = "output.txt";
pub const OUTPUT_SRT: &str = "output.srt";
pub const LOG_NAME: &str = "stdout.log";

/// Snapshot of one job as found on disk.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub created_at: Option<DateTime<Local>>,
    pub dir: PathBuf,
    pub stage: JobStage,
    pub artifacts: BTreeSet<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub jobs: usize,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct JobStorage {
    root: PathBuf,
    normalized_name: String,
}

impl JobStorage {
    pub fn new(root: impl Into<PathBuf>, normalized_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            normalized_name: normalized_name.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.storage.root, &config.normalize.output_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Names the pipeline produces. Uploads may not use them.
    pub fn is_reserved(&self, name: &str) -> bool {
        name == OUTPUT_TXT || name == OUTPUT_SRT || name == LOG_NAME || name == self.normalized_name
    }

    fn existing_job_dir(&self, id: &JobId) -> JobResult<PathBuf> {
        let dir = self.job_dir(id);
        match std::fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(JobError::NotFound(format!("job {id}"))),
            Err(e) => Err(JobError::from_io(e, format!("job {id}"))),
        }
    }

    /// Allocate a fresh job directory.
    pub fn create_job(&self) -> JobResult<JobId> {
        std::fs::create_dir_all(&self.root)?;
        let id = JobId::generate();
        let dir = self.job_dir(&id);
        // create_dir (not create_dir_all) so an existing directory is an error.
        std::fs::create_dir(&dir)?;
        JobStatus::new(JobStage::Created).write(&dir)?;
        tracing::info!("Created job {}", id);
        Ok(id)
    }

    /// Store the uploaded file under its sanitized name.
    pub fn save_upload(&self, id: &JobId, name: &str, bytes: &[u8]) -> JobResult<PathBuf> {
        let dir = self.existing_job_dir(id)?;
        let name = sanitize_filename(name)
            .ok_or_else(|| JobError::InvalidInput(format!("unusable upload filename {name:?}")))?;
        if self.is_reserved(&name) {
            return Err(JobError::InvalidInput(format!(
                "upload filename {name:?} is reserved"
            )));
        }
        if let Some(existing) = self.raw_inputs(id)?.into_iter().next() {
            return Err(JobError::InvalidInput(format!(
                "job {id} already has an upload ({existing})"
            )));
        }

        let path = dir.join(&name);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        tracing::info!("Saved upload {} ({} bytes) for job {}", name, bytes.len(), id);
        Ok(path)
    }

    /// Artifacts that are neither pipeline outputs nor internal files.
    pub fn raw_inputs(&self, id: &JobId) -> JobResult<Vec<String>> {
        Ok(self
            .list_artifacts(id)?
            .into_iter()
            .filter(|name| !self.is_reserved(name))
            .collect())
    }

    /// All job ids, oldest first. Entries vanishing mid-scan are skipped.
    pub fn list_jobs(&self) -> JobResult<Vec<JobId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            if let Some(Ok(id)) = entry.file_name().to_str().map(str::parse::<JobId>) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn list_artifacts(&self, id: &JobId) -> JobResult<BTreeSet<String>> {
        let entries = std::fs::read_dir(self.job_dir(id))
            .map_err(|e| JobError::from_io(e, format!("job {id}")))?;

        let mut names = BTreeSet::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.insert(name.to_owned());
                }
            }
        }
        Ok(names)
    }

    pub fn artifact_path(&self, id: &JobId, name: &str) -> JobResult<PathBuf> {
        validate_artifact_name(name)?;
        Ok(self.job_dir(id).join(name))
    }

    pub fn read_artifact(&self, id: &JobId, name: &str) -> JobResult<Vec<u8>> {
        let path = self.artifact_path(id, name)?;
        std::fs::read(&path).map_err(|e| JobError::from_io(e, format!("{name} in job {id}")))
    }

    /// Replace (or create) an artifact atomically.
    pub fn write_artifact(&self, id: &JobId, name: &str, bytes: &[u8]) -> JobResult<PathBuf> {
        let path = self.artifact_path(id, name)?;
        let dir = self.existing_job_dir(id)?;
        let tmp_path = dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    /// Remove the job directory and everything in it. Returns the bytes freed.
    pub fn delete_job(&self, id: &JobId) -> JobResult<u64> {
        let dir = self.existing_job_dir(id)?;
        let size = dir_size(&dir).unwrap_or(0);
        std::fs::remove_dir_all(&dir).map_err(|e| JobError::from_io(e, format!("job {id}")))?;
        tracing::info!("Deleted job {} ({} bytes)", id, size);
        Ok(size)
    }

    pub fn read_status(&self, id: &JobId) -> JobResult<JobStatus> {
        let dir = self.existing_job_dir(id)?;
        if let Some(status) = JobStatus::read(&dir) {
            return Ok(status);
        }
        // No record (older job or external copy): infer from what exists.
        let artifacts = self.list_artifacts(id)?;
        let stage = if artifacts.contains(OUTPUT_TXT) || artifacts.contains(OUTPUT_SRT) {
            JobStage::Completed
        } else {
            JobStage::Created
        };
        Ok(JobStatus::new(stage))
    }

    /// Persist a status record. Never recreates a deleted job directory.
    pub fn write_status(&self, id: &JobId, status: &JobStatus) -> JobResult<()> {
        let dir = self.existing_job_dir(id)?;
        status.write(&dir)
    }

    pub fn inspect(&self, id: &JobId) -> JobResult<Job> {
        let status = self.read_status(id)?;
        let artifacts = self.list_artifacts(id)?;
        Ok(Job {
            id: id.clone(),
            created_at: id.created_at(),
            dir: self.job_dir(id),
            stage: status.stage,
            artifacts,
            error_message: status.error_message,
        })
    }

    /// Jobs created more than `retention_days` days ago, oldest first.
    pub fn expired_jobs(&self, retention_days: u32) -> JobResult<Vec<JobId>> {
        let today = Local::now().date_naive();
        // A cutoff before the earliest representable date expires nothing.
        let Some(cutoff) = today.checked_sub_days(Days::new(retention_days.into())) else {
            return Ok(Vec::new());
        };
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|id| id.created_at().is_some_and(|at| at.date_naive() < cutoff))
            .collect())
    }

    pub fn stats(&self) -> JobResult<StorageStats> {
        let mut stats = StorageStats::default();
        for id in self.list_jobs()? {
            let Ok(entries) = std::fs::read_dir(self.job_dir(&id)) else { continue };
            stats.jobs += 1;
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        stats.files += 1;
                        stats.bytes += meta.len();
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Reduce an uploaded filename to a safe single path component.
///
/// Keeps the last path segment, ASCII alphanumerics and `.-_`; whitespace
/// becomes `_`. Leading and trailing `.`/`_` are trimmed so the result is never
/// hidden, `.` or `..`. Returns `None` if nothing usable remains.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut out = String::with_capacity(base.len());
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            out.push(c);
        } else if c.is_whitespace() {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches(['.', '_']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn validate_artifact_name(name: &str) -> JobResult<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if bad {
        Err(JobError::InvalidInput(format!("bad artifact name {name:?}")))
    } else {
        Ok(())
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            } else if metadata.is_dir() {
                total += dir_size(&entry.path())?;
            }
        }
    }
    Ok(total)
}
