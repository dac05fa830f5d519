use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use crate::edit::EditSpec;
use crate::error::ClipResult;
use crate::persist::{is_scratch_file, write_json_atomic};

pub type JobId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the registry accepts a move from `self` to `to`.
    ///
    /// Running to Running carries progress and pid updates.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a job produces
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Segments of a video cut into a new file under the edits dir
    #[default]
    Edit,
    /// Full-length playback copy under the compat dir
    Compat,
}

/// One edit request and everything known about its execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub video_id: String,
    #[serde(default)]
    pub kind: JobKind,
    pub edit_spec: EditSpec,
    pub state: JobState,
    pub progress_percent: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Where the finished output is (or will be) published
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Resolved source file, kept so recovery can find temp outputs
    pub source_path: Option<PathBuf>,
    /// Transcoder process id while running
    pub pid: Option<u32>,
    /// Cancel was requested but the process has not exited yet
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(edit_spec: EditSpec) -> Self {
        Self::with_kind(edit_spec, JobKind::Edit)
    }

    pub fn with_kind(edit_spec: EditSpec, kind: JobKind) -> Self {
        Job {
            job_id: uuid::Uuid::new_v4().to_string(),
            video_id: edit_spec.video_id.clone(),
            kind,
            edit_spec,
            state: JobState::Queued,
            progress_percent: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output_path: None,
            error: None,
            source_path: None,
            pid: None,
            cancel_requested: false,
        }
    }

    /// State as reported to callers: a pending cancel reads as cancelled
    pub fn reported_state(&self) -> JobState {
        if self.cancel_requested && self.state.is_active() {
            JobState::Cancelled
        } else {
            self.state
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id.clone(),
            video_id: self.video_id.clone(),
            kind: self.kind,
            state: self.reported_state(),
            progress_percent: self.progress_percent,
            output_path: self.output_path.clone(),
            error: self.error.clone(),
        }
    }
}

/// Polling response for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub video_id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub progress_percent: f64,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
}

fn job_file(job_id: &str, job_state_dir: &Path) -> PathBuf {
    job_state_dir.join(format!("{}.json", job_id))
}

/// Save a job to `<job_state_dir>/<job_id>.json`
pub fn save_job(job: &Job, job_state_dir: &Path) -> ClipResult<()> {
    write_json_atomic(&job_file(&job.job_id, job_state_dir), job)
}

pub fn remove_job_file(job_id: &str, job_state_dir: &Path) -> ClipResult<()> {
    let path = job_file(job_id, job_state_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load every job file in `job_state_dir`.
///
/// Unreadable or corrupt files are skipped with a warning; interrupted
/// atomic writes are removed.
pub fn load_all_jobs(job_state_dir: &Path) -> Result<Vec<Job>> {
    if !job_state_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(job_state_dir)
        .with_context(|| format!("Failed to read job state dir: {}", job_state_dir.display()))?;

    let mut jobs = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if is_scratch_file(&path) {
            let _ = fs::remove_file(&path);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read job file {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_str::<Job>(&content) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping corrupt job file {}: {}", path.display(), e),
        }
    }

    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(jobs)
}
