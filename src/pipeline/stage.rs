use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{NormalizeConfig, TranscribeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Normalize,
    Transcribe,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normalize => write!(f, "normalize"),
            Self::Transcribe => write!(f, "transcribe"),
        }
    }
}

/// One external program invocation, fully rendered.
#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: StageKind,
    pub program: String,
    pub args: Vec<String>,
    /// Must exist before the stage may run.
    pub input: PathBuf,
    /// Files the program is expected to write.
    pub outputs: Vec<PathBuf>,
}

impl Stage {
    pub fn normalize(config: &NormalizeConfig, input: &Path, output: &Path) -> Self {
        let input_str = input.to_string_lossy().into_owned();
        let output_str = output.to_string_lossy().into_owned();
        let rate = config.sample_rate.to_string();
        let args = render_args(
            &config.args,
            &[
                ("input", input_str.as_str()),
                ("output", output_str.as_str()),
                ("sample_rate", rate.as_str()),
            ],
        );
        Self {
            kind: StageKind::Normalize,
            program: config.binary.clone(),
            args,
            input: input.to_path_buf(),
            outputs: vec![output.to_path_buf()],
        }
    }

    pub fn transcribe(config: &TranscribeConfig, input: &Path) -> Self {
        let input_str = input.to_string_lossy().into_owned();
        let stem_str = input.with_extension("").to_string_lossy().into_owned();
        let args = render_args(
            &config.args,
            &[
                ("model", config.model.as_str()),
                ("input", input_str.as_str()),
                ("output_stem", stem_str.as_str()),
            ],
        );
        Self {
            kind: StageKind::Transcribe,
            program: config.binary.clone(),
            args,
            input: input.to_path_buf(),
            outputs: vec![
                transcript_candidates(input, "txt")[0].clone(),
                transcript_candidates(input, "srt")[0].clone(),
            ],
        }
    }

    /// Human-readable command line for logs.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are left as-is.
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

/// Where a transcriber may have written its `ext` output for `input`, in
/// preference order: `<input>.<ext>` (whisper.cpp) then `<stem>.<ext>`.
pub fn transcript_candidates(input: &Path, ext: &str) -> [PathBuf; 2] {
    let mut appended = OsString::from(input.as_os_str());
    appended.push(".");
    appended.push(ext);
    [PathBuf::from(appended), input.with_extension(ext)]
}
