use std::time::Duration;

use thiserror::Error;

/// Failures raised by the shell session layer
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start shell '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to execute command: {0}")]
    Write(#[from] std::io::Error),
    #[error("Command queue is full ({capacity} waiting), dropped '{command}'")]
    QueueFull { capacity: usize, command: String },
    #[error("Dropped {count} queued command(s): shell did not become ready within {timeout:?}")]
    NotReady { count: usize, timeout: Duration },
}

/// Failures of the external analysis call. All of them degrade to a fallback reply.
#[derive(Error, Debug)]
pub enum AssistError {
    #[error("No API key configured for the analysis service")]
    MissingApiKey,
    #[error("Analysis request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Analysis service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Analysis request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Malformed analysis response: {0}")]
    Malformed(String),
}
