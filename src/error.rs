use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no recognized audio file in job {0}")]
    NoInputFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not launch `{program}`: {source}")]
    ExecutorFault {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job {0} is running")]
    JobBusy(String),

    #[error("{stage} stage exited with {status}")]
    StageFailed { stage: String, status: String },

    #[error("{stage} stage input `{artifact}` is missing")]
    MissingStageInput { stage: String, artifact: String },

    #[error("missing expected artifact: {0}")]
    MissingArtifact(String),

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// Map an io error from a job path, turning `NotFound` into the typed variant.
    #[must_use]
    pub fn from_io(err: std::io::Error, what: impl Into<String>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(what.into())
        } else {
            Self::Storage(err)
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_io_maps_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let mapped = JobError::from_io(err, "job x");
        assert!(mapped.is_not_found());
        assert_eq!(mapped.to_string(), "not found: job x");
    }

    #[test]
    fn from_io_keeps_other_kinds_as_storage() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let mapped = JobError::from_io(err, "job x");
        assert!(matches!(mapped, JobError::Storage(_)));
    }

    #[test]
    fn stage_failed_message() {
        let err = JobError::StageFailed {
            stage: "normalize".to_owned(),
            status: "exit code 1".to_owned(),
        };
        assert_eq!(err.to_string(), "normalize stage exited with exit code 1");
    }
}
