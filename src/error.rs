// OpenReLife Desktop - Error Types
// Failures that the supervisor and the recording client report to the shell

use thiserror::Error;

/// Errors raised while starting or stopping the backend process
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The launcher executable could not be found on the augmented PATH
    #[error("Backend launcher `{program}` was not found. {hint}")]
    LauncherNotFound { program: String, hint: String },

    #[error("Failed to spawn backend via `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open backend log: {0}")]
    LogSink(#[from] std::io::Error),

    #[error("Backend process exited before its PID could be read")]
    MissingPid,
}

/// Errors raised by requests against the backend's recording endpoints
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {0}")]
    Status(reqwest::StatusCode),
}
