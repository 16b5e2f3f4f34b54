use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub normalize: NormalizeConfig,
    pub transcribe: TranscribeConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per job.
    pub root: PathBuf,
    /// Jobs older than this are removed by `prune`. 0 keeps everything.
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub binary: String,
    /// Argument template. `{input}`, `{output}` and `{sample_rate}` are substituted.
    pub args: Vec<String>,
    pub sample_rate: u32,
    /// File name of the normalized audio inside the job directory.
    pub output_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscribeConfig {
    pub binary: String,
    pub model: String,
    /// Argument template. `{model}`, `{input}` and `{output_stem}` are substituted.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub failure_policy: FailurePolicy,
    /// Extensions (lowercase, without dot) accepted as raw input.
    pub audio_extensions: Vec<String>,
    /// Lines buffered between a stage's output readers and the controller.
    pub line_buffer: usize,
}

/// What to do when the normalize stage exits unsuccessfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the job immediately.
    Strict,
    /// Log a warning and let transcription try anyway.
    #[default]
    BestEffort,
}

// --- Default implementations ---

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("audioscribe")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("jobs"),
            retention_days: 0,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            args: ["-nostdin", "-y", "-i", "{input}", "-ar", "{sample_rate}", "{output}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sample_rate: 16000,
            output_name: "input.wav".to_string(),
        }
    }
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            binary: "whisper-cli".to_string(),
            model: data_dir()
                .join("models")
                .join("ggml-base.en.bin")
                .to_string_lossy()
                .to_string(),
            args: ["-otxt", "-osrt", "-m", "{model}", "{input}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            audio_extensions: ["wav", "mp3", "webm", "m4a", "ogg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            line_buffer: 16,
        }
    }
}

// --- Config loading ---

impl Config {
    /// Load config and return the resolved file path (if any).
    pub fn load_with_path(path: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        // 1. Check explicit path
        if let Some(p) = path {
            let content = std::fs::read_to_string(p).map_err(|e| {
                anyhow::anyhow!("Failed to read config file {}: {}", p.display(), e)
            })?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(p.to_path_buf())));
        }

        // 2. Check beside the executable
        if let Ok(exe_path) = std::env::current_exe() {
            let beside_exe = exe_path.parent().map(|p| p.join("audioscribe.toml"));
            if let Some(p) = beside_exe {
                if p.exists() {
                    let content = std::fs::read_to_string(&p)?;
                    let config: Config = toml::from_str(&content)?;
                    return Ok((config, Some(p)));
                }
            }
        }

        // 3. Check platform config directory (e.g. ~/.config/audioscribe/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let platform_config = config_dir.join("audioscribe").join("config.toml");
            if platform_config.exists() {
                let content = std::fs::read_to_string(&platform_config)?;
                let config: Config = toml::from_str(&content)?;
                return Ok((config, Some(platform_config)));
            }
        }

        // 4. Fall back to defaults
        tracing::info!("No config file found, using defaults");
        Ok((Config::default(), None))
    }

    /// Generate a default config file with all fields and inline documentation.
    pub fn generate_default_commented() -> String {
        let defaults = Config::default();
        let root_str = defaults
            .storage
            .root
            .to_string_lossy()
            .replace('\\', "\\\\");
        let model_str = defaults.transcribe.model.replace('\\', "\\\\");

        format!(
r#"# audioscribe configuration
# Settings are read once at startup. Edit and rerun to apply changes.

[storage]
# Directory holding one subdirectory per job.
root = "{root}"
# Jobs older than this many days are removed by `audioscribe prune`.
# 0 keeps jobs forever.
retention_days = 0

[normalize]
# Program converting the upload to fixed-rate audio.
binary = "ffmpeg"
# Argument template. {{input}}, {{output}} and {{sample_rate}} are substituted.
args = ["-nostdin", "-y", "-i", "{{input}}", "-ar", "{{sample_rate}}", "{{output}}"]
# Target sample rate in Hz. whisper.cpp expects 16000.
sample_rate = 16000
# Name of the normalized file inside the job directory.
output_name = "input.wav"

[transcribe]
# Speech-to-text program (whisper.cpp CLI).
binary = "whisper-cli"
# Model file passed as {{model}}.
model = "{model}"
# Argument template. {{model}}, {{input}} and {{output_stem}} are substituted.
# The program must write <input>.txt and/or <input>.srt next to the input.
args = ["-otxt", "-osrt", "-m", "{{model}}", "{{input}}"]

[pipeline]
# What to do when normalization fails: "strict" fails the job,
# "best_effort" logs a warning and still tries to transcribe.
failure_policy = "best_effort"
# File extensions accepted as the uploaded audio.
audio_extensions = ["wav", "mp3", "webm", "m4a", "ogg"]
# Output lines buffered between a running stage and the progress stream.
line_buffer = 16
"#,
            root = root_str,
            model = model_str
        )
    }
}
