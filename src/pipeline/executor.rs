// Stage executor: runs one external program and streams its output lines.
//
// stdout and stderr each get a reader thread. Both feed one bounded channel,
// so a slow consumer stalls the readers, then the pipes, then the program.
// Lines from the two streams are interleaved in arrival order.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{JobError, JobResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns stage programs. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StageExecutor {
    line_buffer: usize,
    cancel: Option<Arc<AtomicBool>>,
}

/// How a stage program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// The run was killed because cancellation was requested.
    pub cancelled: bool,
}

impl StageExit {
    fn from_status(status: ExitStatus, cancelled: bool) -> Self {
        Self {
            code: status.code(),
            success: status.success() && !cancelled,
            cancelled,
        }
    }
}

impl fmt::Display for StageExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            return write!(f, "cancelled");
        }
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "termination by signal"),
        }
    }
}

impl StageExecutor {
    /// `line_buffer` is the number of lines that may queue up ahead of the
    /// consumer (0 means every line is handed over directly).
    pub fn new(line_buffer: usize) -> Self {
        Self {
            line_buffer,
            cancel: None,
        }
    }

    /// Kill running programs once `flag` becomes true.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(&self, program: &str, args: &[String], cwd: &Path) -> JobResult<StageRun> {
        let fault = |source: std::io::Error| JobError::ExecutorFault {
            program: program.to_owned(),
            source,
        };

        if !cwd.is_dir() {
            return Err(fault(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory {} does not exist", cwd.display()),
            )));
        }

        tracing::debug!("Spawning {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(fault)?;

        let (sender, receiver) = mpsc::sync_channel(self.line_buffer);
        let mut readers = Vec::with_capacity(2);
        let pipes: [(&str, Option<Box<dyn Read + Send>>); 2] = [
            ("stdout", child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>)),
            ("stderr", child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>)),
        ];
        for (name, pipe) in pipes {
            let Some(pipe) = pipe else { continue };
            match spawn_reader(name, pipe, sender.clone()) {
                Ok(handle) => readers.push(handle),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(fault(e));
                }
            }
        }
        drop(sender);

        Ok(StageRun {
            program: program.to_owned(),
            child,
            lines: receiver,
            readers,
            cancel: self.cancel.clone(),
            cancelled: false,
            finished: false,
        })
    }
}

fn spawn_reader(
    name: &str,
    pipe: Box<dyn Read + Send>,
    sender: SyncSender<String>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("stage-{name}"))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        // Receiver gone: the run was dropped or cancelled.
                        if sender.send(decode_line(&buf)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Stage output read failed: {}", e);
                        break;
                    }
                }
            }
        })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// A running stage program.
///
/// Iterating yields output lines until both streams close (or cancellation
/// is requested). Then call [`StageRun::wait`] for the exit status. Dropping an
/// unfinished run kills the program.
pub struct StageRun {
    program: String,
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    cancel: Option<Arc<AtomicBool>>,
    cancelled: bool,
    finished: bool,
}

impl StageRun {
    fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn kill(&mut self) {
        tracing::info!("Killing {} (pid {})", self.program, self.child.id());
        if let Err(e) = self.child.kill() {
            tracing::debug!("kill failed (already exited?): {}", e);
        }
        self.cancelled = true;
    }

    /// Wait for the program to exit. Lines not yet consumed are discarded.
    pub fn wait(mut self) -> JobResult<StageExit> {
        for line in self.by_ref() {
            tracing::trace!("discarded stage line: {}", line);
        }
        let status = self.child.wait().map_err(|source| JobError::ExecutorFault {
            program: self.program.clone(),
            source,
        })?;
        if self.cancelled {
            // Orphaned grandchildren may still hold the pipes open; detach.
            self.readers.clear();
        } else {
            for handle in self.readers.drain(..) {
                let _ = handle.join();
            }
        }
        self.finished = true;
        let exit = StageExit::from_status(status, self.cancelled);
        tracing::debug!("{} finished: {}", self.program, exit);
        Ok(exit)
    }
}

impl Iterator for StageRun {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.cancelled {
            return None;
        }
        loop {
            if self.cancel_requested() {
                self.kill();
                return None;
            }
            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

impl Drop for StageRun {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_streams_stdout_in_order() {
        let tmp = TempDir::new().unwrap();
        let mut run = StageExecutor::new(4)
            .run("sh", &sh("echo one; echo two; echo three"), tmp.path())
            .unwrap();
        let lines: Vec<String> = run.by_ref().collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
        let exit = run.wait().unwrap();
        assert!(exit.success);
        assert_eq!(exit.code, Some(0));
    }

    #[test]
    fn test_merges_stderr() {
        let tmp = TempDir::new().unwrap();
        let mut run = StageExecutor::new(4)
            .run("sh", &sh("echo out; echo err >&2"), tmp.path())
            .unwrap();
        let mut lines: Vec<String> = run.by_ref().collect();
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert!(run.wait().unwrap().success);
    }

    #[test]
    fn test_nonzero_exit_is_reported_not_raised() {
        let tmp = TempDir::new().unwrap();
        let run = StageExecutor::new(4)
            .run("sh", &sh("echo failing; exit 3"), tmp.path())
            .unwrap();
        let exit = run.wait().unwrap();
        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.to_string(), "exit code 3");
    }

    #[test]
    fn test_zero_buffer_still_delivers_everything() {
        let tmp = TempDir::new().unwrap();
        let mut run = StageExecutor::new(0)
            .run("sh", &sh("for i in 1 2 3 4 5 6 7 8; do echo $i; done"), tmp.path())
            .unwrap();
        let lines: Vec<String> = run.by_ref().collect();
        assert_eq!(lines, vec!["1", "2", "3", "4", "5", "6", "7", "8"]);
        assert!(run.wait().unwrap().success);
    }

    #[test]
    fn test_crlf_and_invalid_utf8() {
        let tmp = TempDir::new().unwrap();
        let mut run = StageExecutor::new(4)
            .run("sh", &sh("printf 'dos\\r\\n'; printf '\\377ok\\n'; printf 'tail'"), tmp.path())
            .unwrap();
        let lines: Vec<String> = run.by_ref().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "dos");
        assert!(lines[1].ends_with("ok"));
        assert!(lines[1].contains('\u{FFFD}'));
        assert_eq!(lines[2], "tail");
        run.wait().unwrap();
    }

    #[test]
    fn test_runs_in_working_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "here").unwrap();
        let mut run = StageExecutor::new(4)
            .run("sh", &sh("cat marker.txt"), tmp.path())
            .unwrap();
        assert_eq!(run.next().as_deref(), Some("here"));
        run.wait().unwrap();
    }

    #[test]
    fn test_missing_program_is_executor_fault() {
        let tmp = TempDir::new().unwrap();
        let result = StageExecutor::new(4).run("definitely-not-a-real-binary-xyz", &[], tmp.path());
        assert!(matches!(result, Err(JobError::ExecutorFault { .. })));
    }

    #[test]
    fn test_missing_cwd_is_executor_fault() {
        let tmp = TempDir::new().unwrap();
        let result = StageExecutor::new(4).run("sh", &sh("true"), &tmp.path().join("gone"));
        assert!(matches!(result, Err(JobError::ExecutorFault { .. })));
    }

    #[test]
    fn test_cancel_kills_silent_program() {
        let tmp = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let mut run = StageExecutor::new(4)
            .with_cancel(flag.clone())
            .run("sh", &sh("sleep 30"), tmp.path())
            .unwrap();

        let setter = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            setter.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        assert!(run.next().is_none());
        let exit = run.wait().unwrap();
        assert!(exit.cancelled);
        assert!(!exit.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
