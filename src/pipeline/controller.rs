// Pipeline controller: drives one job through normalize -> transcribe -> finalize.
//
// A run claims its job in the registry, opens the job's progress stream and
// then executes on its own thread. Errors past that point never reach the
// caller that started the run; they become a `failed` status, an `error:` line
// and a failed `Done` event.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::{Config, FailurePolicy};
use crate::error::{JobError, JobResult};
use crate::jobs::storage::{LOG_NAME, OUTPUT_SRT, OUTPUT_TXT};
use crate::jobs::{JobId, JobRegistry, JobStage, JobStatus, JobStorage, JobGuard};
use crate::pipeline::executor::{StageExecutor, StageExit};
use crate::pipeline::progress::{JobOutcome, ProgressChannel, ProgressPublisher, Subscription};
use crate::pipeline::stage::{transcript_candidates, Stage, StageKind};

#[derive(Debug, Clone)]
pub struct PipelineController {
    config: Arc<Config>,
    registry: JobRegistry,
    progress: ProgressChannel,
    interrupt: Option<Arc<AtomicBool>>,
}

/// A pipeline running on its own thread.
pub struct PipelineHandle {
    id: JobId,
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<JobOutcome>,
}

impl PipelineHandle {
    /// Ask the run to stop. The active stage is killed and the job fails.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn join(self) -> JobOutcome {
        let id = self.id;
        self.thread.join().unwrap_or_else(|_| {
            tracing::error!("Pipeline thread for job {} panicked", id);
            JobOutcome::failed("pipeline thread panicked")
        })
    }
}

impl PipelineController {
    pub fn new(config: Config, registry: JobRegistry, progress: ProgressChannel) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            progress,
            interrupt: None,
        }
    }

    /// Share one cancellation flag across every run this controller starts,
    /// e.g. one set on Ctrl+C. Cancelling any handle then stops all of them.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Build storage, registry and progress hub from `config`.
    pub fn from_config(config: &Config) -> Self {
        let registry = JobRegistry::new(JobStorage::from_config(config));
        let progress = ProgressChannel::new(config.pipeline.line_buffer);
        Self::new(config.clone(), registry, progress)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &JobStorage {
        self.registry.storage()
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    fn prepare(&self, id: &JobId) -> JobResult<PipelineRun> {
        let guard = self.registry.claim(id)?;
        let storage = self.registry.storage().clone();
        let publisher = self
            .progress
            .open(id, &storage.job_dir(id).join(LOG_NAME))?;
        let cancel = self
            .interrupt
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let executor =
            StageExecutor::new(self.config.pipeline.line_buffer).with_cancel(Arc::clone(&cancel));

        Ok(PipelineRun {
            id: id.clone(),
            config: Arc::clone(&self.config),
            storage,
            executor,
            publisher,
            cancel,
            guard,
        })
    }

    /// Start the pipeline for `id` on a new thread, without an observer.
    pub fn start(&self, id: &JobId) -> JobResult<PipelineHandle> {
        let run = self.prepare(id)?;
        spawn(run)
    }

    /// Start the pipeline with the caller attached as observer before the
    /// first line is emitted.
    pub fn start_observed(&self, id: &JobId) -> JobResult<(PipelineHandle, Subscription)> {
        let run = self.prepare(id)?;
        let subscription = self.progress.subscribe(id)?;
        let handle = spawn(run)?;
        Ok((handle, subscription))
    }

    /// Run the pipeline on the calling thread.
    pub fn run_blocking(&self, id: &JobId) -> JobResult<JobOutcome> {
        Ok(self.prepare(id)?.execute())
    }
}

fn spawn(run: PipelineRun) -> JobResult<PipelineHandle> {
    let id = run.id.clone();
    let cancel = Arc::clone(&run.cancel);
    let thread = std::thread::Builder::new()
        .name(format!("pipeline-{id}"))
        .spawn(move || run.execute())
        .map_err(|source| JobError::ExecutorFault {
            program: "pipeline thread".to_owned(),
            source,
        })?;
    Ok(PipelineHandle { id, cancel, thread })
}

struct PipelineRun {
    id: JobId,
    config: Arc<Config>,
    storage: JobStorage,
    executor: StageExecutor,
    publisher: ProgressPublisher,
    cancel: Arc<AtomicBool>,
    guard: JobGuard,
}

impl PipelineRun {
    fn execute(mut self) -> JobOutcome {
        tracing::info!("Pipeline started for job {}", self.id);
        let outcome = match self.drive() {
            Ok(()) => JobOutcome::Completed,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Job {} failed: {}", self.id, reason);
                if let Err(log_err) = self.publisher.publish(&format!("error: {reason}")) {
                    tracing::warn!("Could not log failure for job {}: {}", self.id, log_err);
                }
                if let Err(status_err) = self
                    .storage
                    .write_status(&self.id, &JobStatus::failed(&reason))
                {
                    tracing::warn!("Could not record failure for job {}: {}", self.id, status_err);
                }
                JobOutcome::failed(reason)
            }
        };

        let PipelineRun {
            id,
            publisher,
            guard,
            ..
        } = self;
        // Release the job before signalling Done so observers may delete it at once.
        drop(guard);
        publisher.finish(outcome.clone());
        tracing::info!("Pipeline for job {} {}", id, outcome);
        outcome
    }

    fn drive(&mut self) -> JobResult<()> {
        let dir = self.storage.job_dir(&self.id);
        let normalized = dir.join(self.storage.normalized_name());

        self.set_stage(JobStage::Converting)?;
        self.clear_derived(&normalized)?;
        let raw = self.find_input()?;

        self.check_cancelled()?;
        self.say(&format!(
            "Converting audio to {} Hz...",
            self.config.normalize.sample_rate
        ))?;
        let stage = Stage::normalize(&self.config.normalize, &dir.join(&raw), &normalized);
        let exit = self.run_stage(&stage, &dir)?;
        if !exit.success {
            if exit.cancelled {
                return Err(JobError::Cancelled);
            }
            match self.config.pipeline.failure_policy {
                FailurePolicy::Strict => {
                    return Err(JobError::StageFailed {
                        stage: StageKind::Normalize.to_string(),
                        status: exit.to_string(),
                    })
                }
                FailurePolicy::BestEffort => {
                    tracing::warn!("Job {}: normalize ended with {}, continuing", self.id, exit);
                    self.say(&format!("warning: normalize ended with {exit}, continuing"))?;
                }
            }
        }

        self.check_cancelled()?;
        self.set_stage(JobStage::Transcribing)?;
        self.say("Running transcription...")?;
        let transcribe = Stage::transcribe(&self.config.transcribe, &normalized);
        let exit = self.run_stage(&transcribe, &dir)?;
        if exit.cancelled {
            return Err(JobError::Cancelled);
        }
        if !exit.success {
            return Err(JobError::StageFailed {
                stage: StageKind::Transcribe.to_string(),
                status: exit.to_string(),
            });
        }

        self.finalize(&transcribe)?;
        self.say("Transcription complete")?;
        self.set_stage(JobStage::Completed)
    }

    fn say(&mut self, line: &str) -> JobResult<()> {
        self.publisher.publish(line)
    }

    fn set_stage(&self, stage: JobStage) -> JobResult<()> {
        tracing::info!("Job {} -> {}", self.id, stage);
        self.storage.write_status(&self.id, &JobStatus::new(stage))
    }

    fn check_cancelled(&self) -> JobResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// First artifact (by name) with a recognized audio extension.
    fn find_input(&self) -> JobResult<String> {
        self.storage
            .raw_inputs(&self.id)?
            .into_iter()
            .find(|name| has_audio_extension(name, &self.config.pipeline.audio_extensions))
            .ok_or_else(|| JobError::NoInputFound(self.id.to_string()))
    }

    /// Remove outputs of an earlier run so only this run's results survive.
    fn clear_derived(&self, normalized: &Path) -> JobResult<()> {
        let dir = self.storage.job_dir(&self.id);
        let mut stale = vec![
            normalized.to_path_buf(),
            dir.join(OUTPUT_TXT),
            dir.join(OUTPUT_SRT),
        ];
        for ext in ["txt", "srt"] {
            stale.extend(transcript_candidates(normalized, ext));
        }
        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed stale {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn run_stage(&mut self, stage: &Stage, cwd: &Path) -> JobResult<StageExit> {
        if !stage.input.is_file() {
            return Err(JobError::MissingStageInput {
                stage: stage.kind.to_string(),
                artifact: stage
                    .input
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            });
        }

        tracing::info!("Job {}: {}", self.id, stage.command_line());
        let mut run = self.executor.run(&stage.program, &stage.args, cwd)?;
        for line in run.by_ref() {
            self.publisher.publish(&line)?;
        }
        let exit = run.wait()?;
        tracing::info!("Job {}: {} stage finished with {}", self.id, stage.kind, exit);
        Ok(exit)
    }

    /// Move the transcriber's outputs to their stable names (`output.<ext>`)
    /// and clean up the text.
    fn finalize(&mut self, transcribe: &Stage) -> JobResult<()> {
        let dir = self.storage.job_dir(&self.id);
        let mut produced = 0;

        for expected in &transcribe.outputs {
            let Some(ext) = expected.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let final_name = format!("output.{ext}");
            // Some transcribers name outputs after the stem instead.
            let found = [expected.clone(), transcribe.input.with_extension(ext)]
                .into_iter()
                .find(|p| p.is_file());
            match found {
                Some(path) => {
                    std::fs::rename(&path, dir.join(&final_name))?;
                    tracing::info!("Job {}: {} -> {}", self.id, path.display(), final_name);
                    produced += 1;
                }
                None => {
                    tracing::warn!("Job {}: transcriber wrote no .{} file", self.id, ext);
                    self.say(&format!("note: no .{ext} transcript produced"))?;
                }
            }
        }

        if produced == 0 {
            return Err(JobError::MissingArtifact(format!("{OUTPUT_TXT} / {OUTPUT_SRT}")));
        }

        if dir.join(OUTPUT_TXT).is_file() {
            let raw = self.storage.read_artifact(&self.id, OUTPUT_TXT)?;
            let cleaned = strip_leading_blanks(&raw);
            self.storage.write_artifact(&self.id, OUTPUT_TXT, &cleaned)?;
        }
        Ok(())
    }
}

fn has_audio_extension(name: &str, extensions: &[String]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

/// Drop leading ASCII blanks from every line, keeping line endings and any
/// non-UTF-8 bytes intact.
fn strip_leading_blanks(text: &[u8]) -> Vec<u8> {
    let mut cleaned = Vec::with_capacity(text.len());
    for line in text.split_inclusive(|&b| b == b'\n') {
        let start = line
            .iter()
            .position(|b| !matches!(b, b' ' | b'\t' | 0x0b | 0x0c))
            .unwrap_or(line.len());
        cleaned.extend_from_slice(&line[start..]);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        Config::default().pipeline.audio_extensions
    }

    #[test]
    fn test_strip_leading_blanks() {
        let text = b" Hello there.\n\t  General Kenobi.\r\n   \nno indent\n  trailing";
        assert_eq!(
            strip_leading_blanks(text),
            b"Hello there.\nGeneral Kenobi.\r\n\nno indent\ntrailing"
        );
    }

    #[test]
    fn test_strip_leading_blanks_keeps_inner_spacing() {
        assert_eq!(strip_leading_blanks(b"  a  b \n"), b"a  b \n");
        assert!(strip_leading_blanks(b"").is_empty());
    }

    #[test]
    fn test_strip_leading_blanks_preserves_invalid_utf8() {
        let text = b"  \xff\xfeabc\n\t\xc3(\n";
        assert_eq!(strip_leading_blanks(text), b"\xff\xfeabc\n\xc3(\n");
    }

    #[test]
    fn test_has_audio_extension() {
        let exts = extensions();
        assert!(has_audio_extension("talk.MP3", &exts));
        assert!(has_audio_extension("rec.webm", &exts));
        assert!(!has_audio_extension("notes.txt", &exts));
        assert!(!has_audio_extension("wav", &exts));
        assert!(!has_audio_extension("input.wav.txt", &exts));
    }

    fn controller(tmp: &TempDir) -> PipelineController {
        let mut config = Config::default();
        config.storage.root = tmp.path().join("jobs");
        PipelineController::from_config(&config)
    }

    #[test]
    fn test_start_unknown_job_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp);
        let err = controller.start(&JobId::generate()).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_run_without_audio_fails_with_no_input() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp);
        let id = controller.storage().create_job().unwrap();
        controller
            .storage()
            .write_artifact(&id, "readme.txt", b"not audio")
            .unwrap();

        let outcome = controller.run_blocking(&id).unwrap();
        assert!(matches!(&outcome, JobOutcome::Failed { reason } if reason.contains("no recognized audio")));

        let job = controller.registry().inspect(&id).unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert!(job.error_message.is_some());
        assert!(!controller.registry().is_running(&id));
        assert!(!controller.progress().is_live(&id));
    }

    #[test]
    fn test_finalize_moves_each_expected_output() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp);
        let id = controller.storage().create_job().unwrap();
        let dir = controller.storage().job_dir(&id);
        let normalized = dir.join(controller.storage().normalized_name());
        let transcribe = Stage::transcribe(&Config::default().transcribe, &normalized);

        // Text under the expected name, subtitles under the stem-based one.
        std::fs::write(&transcribe.outputs[0], b"  line one\n\xff kept\n").unwrap();
        std::fs::write(normalized.with_extension("srt"), b"1\n").unwrap();

        let mut run = controller.prepare(&id).unwrap();
        run.finalize(&transcribe).unwrap();
        drop(run);

        assert_eq!(
            std::fs::read(dir.join(OUTPUT_TXT)).unwrap(),
            b"line one\n\xff kept\n"
        );
        assert_eq!(std::fs::read(dir.join(OUTPUT_SRT)).unwrap(), b"1\n");
        assert!(!transcribe.outputs[0].exists());
    }

    #[test]
    fn test_finalize_without_outputs_is_missing_artifact() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp);
        let id = controller.storage().create_job().unwrap();
        let normalized = controller
            .storage()
            .job_dir(&id)
            .join(controller.storage().normalized_name());
        let transcribe = Stage::transcribe(&Config::default().transcribe, &normalized);

        let mut run = controller.prepare(&id).unwrap();
        let err = run.finalize(&transcribe).unwrap_err();
        assert!(matches!(err, JobError::MissingArtifact(_)));
    }
}
