//! Error taxonomy shared by the catalog, runner, registry and orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::job::JobState;

#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("path escapes the allowed video roots: {0}")]
    PathEscape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid edit: {0}")]
    Validation(String),

    #[error("video {video_id} already has an active job ({job_id})")]
    AlreadyActive { video_id: String, job_id: String },

    #[error("job {0} has already finished")]
    AlreadyTerminal(String),

    #[error("transcode failed (exit code {}): {stderr_tail}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    TranscodeFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("transcode stalled: no progress for {:.1}s", .0.as_secs_f64())]
    StallTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("ffprobe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ClipError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transcode_failed(exit_code: Option<i32>, stderr_tail: impl Into<String>) -> Self {
        Self::TranscodeFailed {
            exit_code,
            stderr_tail: stderr_tail.into(),
        }
    }

    /// Errors caused by the request itself rather than by the daemon.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::PathEscape(_)
                | Self::NotFound(_)
                | Self::Validation(_)
                | Self::AlreadyActive { .. }
                | Self::AlreadyTerminal(_)
        )
    }
}

pub type ClipResult<T> = Result<T, ClipError>;
