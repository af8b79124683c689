use thiserror::Error;

/// Failures that reject a whole submission before any case is attempted
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("no test cases to judge")]
    NoTestCases,
    #[error("submission cancelled")]
    Cancelled,
}

/// Infrastructure failures of an executor backend
///
/// These never describe the contestant's program; the runner reports them
/// as an internal error for the affected case.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{backend} backend cannot run language {language}")]
    Unsupported {
        backend: &'static str,
        language: String,
    },
    #[error("remote judge unavailable: {0}")]
    Unavailable(String),
    #[error("remote judge did not finish after {0} polls")]
    PollTimeout(u32),
    #[error("remote judge error: {0}")]
    Remote(String),
    #[error("sandbox failure: {0}")]
    Sandbox(String),
}

impl ExecutorError {
    /// Whether the backend as a whole is unreachable, as opposed to one failed execution
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Remote(err.to_string())
        }
    }
}
