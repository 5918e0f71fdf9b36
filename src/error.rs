//! Error taxonomy for the conversion dispatch core.

use std::time::Duration;
use thiserror::Error;

/// Every way a conversion job can end without producing an artifact.
///
/// Each variant is a terminal result for exactly one job. The core never
/// retries; callers map variants to responses with [`ConversionError::http_status`].
#[derive(Debug, Error)]
pub enum ConversionError {
    /// All workers are busy and the queue holds its maximum number of jobs.
    #[error("conversion queue is full")]
    QueueFull,

    /// The queue is draining and no longer admits jobs.
    #[error("conversion queue is shutting down")]
    ShuttingDown,

    /// The job did not finish within the worker deadline.
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),

    /// The external command could not be started or exited non-zero.
    #[error("conversion command `{command}` failed ({}): {stderr}", describe_status(.status))]
    ProcessFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Cancellation was observed before the work completed.
    #[error("conversion cancelled")]
    Cancelled,

    /// The job was cancelled because the queue was drained.
    #[error("conversion cancelled by shutdown")]
    ShutdownCancelled,

    /// Storing a converted artifact failed.
    #[error("upload of '{key}' failed: {reason}")]
    UploadFailed { key: String, reason: String },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_string(),
    }
}

impl ConversionError {
    pub(crate) fn spawn_failed(command: &str, err: impl std::fmt::Display) -> Self {
        Self::ProcessFailed {
            command: command.to_string(),
            status: None,
            stderr: format!("failed to run: {err}"),
        }
    }

    /// The process started but its exit status or output could not be read.
    pub(crate) fn output_failed(command: &str, err: impl std::fmt::Display) -> Self {
        Self::ProcessFailed {
            command: command.to_string(),
            status: None,
            stderr: format!("failed to read process output: {err}"),
        }
    }

    /// HTTP status code for this error at the service boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::QueueFull | Self::ShuttingDown => 503,
            Self::Cancelled | Self::ShutdownCancelled => 503,
            Self::Timeout(_) => 504,
            Self::ProcessFailed { .. } => 500,
            Self::UploadFailed { .. } => 502,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
            Self::Timeout(_) => "timeout",
            Self::ProcessFailed { .. } => "process_failed",
            Self::Cancelled => "cancelled",
            Self::ShutdownCancelled => "shutdown_cancelled",
            Self::UploadFailed { .. } => "upload_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_failed_message_includes_status_and_stderr() {
        let err = ConversionError::ProcessFailed {
            command: "htmlconverter".to_string(),
            status: Some(3),
            stderr: "page crashed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit status 3"), "got: {msg}");
        assert!(msg.contains("page crashed"), "got: {msg}");
    }

    #[test]
    fn backpressure_maps_to_service_unavailable() {
        assert_eq!(ConversionError::QueueFull.http_status(), 503);
        assert_eq!(ConversionError::Timeout(Duration::from_secs(1)).http_status(), 504);
        assert_eq!(ConversionError::QueueFull.code(), "queue_full");
    }

    #[test]
    fn output_failure_is_not_reported_as_spawn_failure() {
        let msg = ConversionError::output_failed("htmlconverter", "broken pipe").to_string();
        assert!(msg.contains("failed to read process output: broken pipe"), "got: {msg}");
        assert!(!msg.contains("failed to run"), "got: {msg}");
    }
}
