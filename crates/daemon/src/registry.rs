//! In-memory job registry with a JSON file per job on disk.
//!
//! All state changes go through `transition`, which rejects illegal moves
//! and keeps the one-active-job-per-video index in sync. Progress updates
//! stay in memory; state changes are written to the job state directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use sysinfo::{Pid, System};

use crate::edit::EditSpec;
use crate::error::{ClipError, ClipResult};
use crate::job::{load_all_jobs, remove_job_file, save_job, Job, JobId, JobKind, JobState, JobStatus};
use crate::runner::temp_output_path;

/// Seconds of slack when comparing a process start time to a job start time
const PID_START_SLACK_SECS: i64 = 5;

/// Fields a transition may set alongside the new state
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub progress_percent: Option<f64>,
    pub output_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub error: Option<String>,
    pub pid: Option<u32>,
}

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running jobs marked Failed
    pub interrupted: usize,
    /// Orphaned transcoders that were still alive and got killed
    pub killed: usize,
    /// Temp outputs removed
    pub temp_removed: usize,
    /// Queued jobs waiting to be dispatched again
    pub queued: usize,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    active_by_video: HashMap<String, JobId>,
}

pub struct JobRegistry {
    inner: Mutex<Inner>,
    job_state_dir: Option<PathBuf>,
}

impl JobRegistry {
    /// Registry that keeps nothing on disk
    pub fn in_memory() -> Self {
        JobRegistry {
            inner: Mutex::new(Inner::default()),
            job_state_dir: None,
        }
    }

    /// Load persisted jobs from `job_state_dir` and recover from an unclean stop.
    ///
    /// Jobs that were Running belonged to the previous process: their
    /// transcoder is killed if it is still alive, their temp output is
    /// removed, and they are marked Failed. Queued jobs are kept.
    pub fn open(job_state_dir: &Path) -> Result<(Self, RecoveryReport)> {
        std::fs::create_dir_all(job_state_dir)
            .with_context(|| format!("Failed to create job state dir: {}", job_state_dir.display()))?;
        let jobs = load_all_jobs(job_state_dir).context("Failed to load jobs for recovery")?;

        let mut report = RecoveryReport::default();
        let mut inner = Inner::default();
        let now = Utc::now();

        for mut job in jobs {
            match job.state {
                JobState::Running => {
                    if let Some(pid) = job.pid {
                        if kill_orphan(pid, job.started_at.unwrap_or(job.created_at)) {
                            warn!("Job {}: killed orphaned transcoder pid {}", job.job_id, pid);
                            report.killed += 1;
                        }
                    }
                    if let Some(output) = &job.output_path {
                        let temp = temp_output_path(output);
                        if temp.exists() {
                            match std::fs::remove_file(&temp) {
                                Ok(()) => {
                                    info!("Job {}: 🗑️  Deleted abandoned temp file: {}", job.job_id, temp.display());
                                    report.temp_removed += 1;
                                }
                                Err(e) => warn!("Job {}: failed to delete temp file {}: {}", job.job_id, temp.display(), e),
                            }
                        }
                    }
                    job.state = JobState::Failed;
                    job.error = Some("interrupted by daemon restart".to_string());
                    job.finished_at = Some(now);
                    job.pid = None;
                    save_job(&job, job_state_dir)?;
                    report.interrupted += 1;
                    info!("Job {}: 🔄 Recovered interrupted job - marked Failed", job.job_id);
                }
                JobState::Queued => {
                    if let Some(existing) = inner.active_by_video.get(&job.video_id) {
                        warn!(
                            "Job {}: video {} already has queued job {}, marking Failed",
                            job.job_id, job.video_id, existing
                        );
                        job.state = JobState::Failed;
                        job.error = Some("duplicate queued job".to_string());
                        job.finished_at = Some(now);
                        save_job(&job, job_state_dir)?;
                    } else {
                        inner.active_by_video.insert(job.video_id.clone(), job.job_id.clone());
                        report.queued += 1;
                    }
                }
                _ => {}
            }
            inner.jobs.insert(job.job_id.clone(), job);
        }

        Ok((
            JobRegistry {
                inner: Mutex::new(inner),
                job_state_dir: Some(job_state_dir.to_path_buf()),
            },
            report,
        ))
    }

    fn persist(&self, job: &Job) -> ClipResult<()> {
        match &self.job_state_dir {
            Some(dir) => save_job(job, dir),
            None => Ok(()),
        }
    }

    /// Register a new Queued job for `spec`.
    ///
    /// Fails with `AlreadyActive` if the video has a Queued or Running job.
    pub fn create(&self, spec: EditSpec) -> ClipResult<Job> {
        self.create_with_kind(spec, JobKind::Edit)
    }

    /// Like `create`, for any job kind. Edits and playback copies share the
    /// one-active-job-per-video rule.
    pub fn create_with_kind(&self, spec: EditSpec, kind: JobKind) -> ClipResult<Job> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.active_by_video.get(&spec.video_id) {
            return Err(ClipError::AlreadyActive {
                video_id: spec.video_id.clone(),
                job_id: existing.clone(),
            });
        }
        let job = Job::with_kind(spec, kind);
        self.persist(&job)?;
        inner.active_by_video.insert(job.video_id.clone(), job.job_id.clone());
        inner.jobs.insert(job.job_id.clone(), job.clone());
        debug!("Job {}: created for {}", job.job_id, job.video_id);
        Ok(job)
    }

    /// Move a job to `to`, applying `update`. Returns the updated job.
    pub fn transition(&self, job_id: &str, to: JobState, update: TransitionUpdate) -> ClipResult<Job> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ClipError::NotFound(format!("job {}", job_id)))?;

        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(ClipError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        let mut changed = from != to;
        job.state = to;
        if let Some(path) = update.output_path {
            job.output_path = Some(path);
        }
        if let Some(path) = update.source_path {
            job.source_path = Some(path);
        }
        if let Some(p) = update.progress_percent {
            let p = p.clamp(0.0, 100.0);
            if p > job.progress_percent {
                job.progress_percent = p;
            }
        }

        match to {
            JobState::Running => {
                if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
                if update.pid.is_some() && update.pid != job.pid {
                    job.pid = update.pid;
                    changed = true;
                }
            }
            JobState::Succeeded => {
                job.progress_percent = 100.0;
                job.finished_at = Some(now);
                job.pid = None;
                job.error = None;
            }
            JobState::Failed | JobState::Cancelled => {
                job.finished_at = Some(now);
                job.pid = None;
                if update.error.is_some() {
                    job.error = update.error;
                }
            }
            JobState::Queued => {}
        }

        let job = job.clone();
        if to.is_terminal() && inner.active_by_video.get(&job.video_id) == Some(&job.job_id) {
            inner.active_by_video.remove(&job.video_id);
        }
        drop(inner);

        if changed {
            if let Err(e) = self.persist(&job) {
                warn!("Job {}: failed to persist {} state: {}", job.job_id, to, e);
            }
        }
        Ok(job)
    }

    /// Record progress for a Running job; returns the stored percent
    pub fn record_progress(&self, job_id: &str, percent: f64) -> ClipResult<f64> {
        self.transition(
            job_id,
            JobState::Running,
            TransitionUpdate {
                progress_percent: Some(percent),
                ..Default::default()
            },
        )
        .map(|job| job.progress_percent)
    }

    /// Mark a job as cancel-requested.
    ///
    /// Returns the job as it was before the request so the caller can tell
    /// whether a process has to be stopped.
    pub fn request_cancel(&self, job_id: &str) -> ClipResult<Job> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ClipError::NotFound(format!("job {}", job_id)))?;
        if job.state.is_terminal() {
            return Err(ClipError::AlreadyTerminal(job_id.to_string()));
        }
        let before = job.clone();
        job.cancel_requested = true;
        let after = job.clone();
        drop(inner);

        if !before.cancel_requested {
            if let Err(e) = self.persist(&after) {
                warn!("Job {}: failed to persist cancel request: {}", job_id, e);
            }
        }
        Ok(before)
    }

    pub fn get(&self, job_id: &str) -> ClipResult<Job> {
        self.inner
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClipError::NotFound(format!("job {}", job_id)))
    }

    pub fn status(&self, job_id: &str) -> ClipResult<JobStatus> {
        self.get(job_id).map(|job| job.status())
    }

    pub fn active_job_for(&self, video_id: &str) -> Option<JobId> {
        self.inner.lock().active_by_video.get(video_id).cloned()
    }

    /// Queued and Running jobs, oldest first
    pub fn list_active(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.state.is_active())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Queued jobs, oldest first
    pub fn queued(&self) -> Vec<Job> {
        self.list_active()
            .into_iter()
            .filter(|j| j.state == JobState::Queued)
            .collect()
    }

    /// Every known job, oldest first
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Most recent Succeeded edit for an identical spec whose output still exists
    pub fn find_succeeded(&self, spec: &EditSpec) -> Option<Job> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.kind == JobKind::Edit && j.state == JobState::Succeeded && &j.edit_spec == spec)
            .filter(|j| j.output_path.as_ref().map(|p| p.is_file()).unwrap_or(false))
            .max_by_key(|j| j.finished_at)
            .cloned()
    }

    /// Drop terminal jobs that finished before `cutoff`. Returns what was removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        let mut inner = self.inner.lock();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|j| j.job_id.clone())
            .collect();
        let removed: Vec<Job> = expired.iter().filter_map(|id| inner.jobs.remove(id)).collect();
        drop(inner);

        if let Some(dir) = &self.job_state_dir {
            for job in &removed {
                if let Err(e) = remove_job_file(&job.job_id, dir) {
                    warn!("Job {}: failed to remove job file: {}", job.job_id, e);
                }
            }
        }
        removed
    }
}

/// Kill `pid` if it is alive and was started around or after `started_after`.
///
/// The start time check keeps a recycled pid from being killed.
fn kill_orphan(pid: u32, started_after: DateTime<Utc>) -> bool {
    let mut system = System::new_all();
    system.refresh_all();
    match system.process(Pid::from_u32(pid)) {
        Some(process) => {
            let started = process.start_time() as i64;
            if started + PID_START_SLACK_SECS >= started_after.timestamp() {
                process.kill()
            } else {
                debug!("pid {} predates job start, leaving it alone", pid);
                false
            }
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::Segment;

    fn spec(video: &str) -> EditSpec {
        EditSpec::new(video, vec![Segment::new(0.0, 10.0)], "")
    }

    fn running(reg: &JobRegistry, video: &str) -> Job {
        let job = reg.create(spec(video)).unwrap();
        reg.transition(&job.job_id, JobState::Running, TransitionUpdate::default())
            .unwrap()
    }

    #[test]
    fn test_one_active_job_per_video() {
        let reg = JobRegistry::in_memory();
        let first = reg.create(spec("a.mp4")).unwrap();
        match reg.create(spec("a.mp4")) {
            Err(ClipError::AlreadyActive { job_id, .. }) => assert_eq!(job_id, first.job_id),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
        assert!(reg.create(spec("b.mp4")).is_ok());

        reg.transition(&first.job_id, JobState::Cancelled, TransitionUpdate::default())
            .unwrap();
        assert!(reg.create(spec("a.mp4")).is_ok());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let reg = JobRegistry::in_memory();
        let job = reg.create(spec("a.mp4")).unwrap();
        let err = reg
            .transition(&job.job_id, JobState::Succeeded, TransitionUpdate::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ClipError::InvalidTransition { from: JobState::Queued, to: JobState::Succeeded, .. }
        ));
        assert_eq!(reg.get(&job.job_id).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_progress_never_decreases() {
        let reg = JobRegistry::in_memory();
        let job = running(&reg, "a.mp4");
        assert_eq!(reg.record_progress(&job.job_id, 40.0).unwrap(), 40.0);
        assert_eq!(reg.record_progress(&job.job_id, 25.0).unwrap(), 40.0);
        assert_eq!(reg.record_progress(&job.job_id, 140.0).unwrap(), 100.0);
    }

    #[test]
    fn test_success_forces_full_progress() {
        let reg = JobRegistry::in_memory();
        let job = running(&reg, "a.mp4");
        reg.record_progress(&job.job_id, 97.0).unwrap();
        let done = reg
            .transition(&job.job_id, JobState::Succeeded, TransitionUpdate::default())
            .unwrap();
        assert_eq!(done.progress_percent, 100.0);
        assert!(done.finished_at.is_some());
        assert!(reg.active_job_for("a.mp4").is_none());
    }

    #[test]
    fn test_request_cancel() {
        let reg = JobRegistry::in_memory();
        let job = running(&reg, "a.mp4");
        let before = reg.request_cancel(&job.job_id).unwrap();
        assert_eq!(before.state, JobState::Running);
        assert_eq!(reg.status(&job.job_id).unwrap().state, JobState::Cancelled);
        // still occupies the video until the process exits
        assert!(reg.active_job_for("a.mp4").is_some());

        reg.transition(&job.job_id, JobState::Cancelled, TransitionUpdate::default())
            .unwrap();
        assert!(matches!(
            reg.request_cancel(&job.job_id),
            Err(ClipError::AlreadyTerminal(_))
        ));
        assert!(matches!(reg.request_cancel("missing"), Err(ClipError::NotFound(_))));
    }

    #[test]
    fn test_prune_only_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = JobRegistry::open(dir.path()).unwrap();
        let old = running(&reg, "a.mp4");
        reg.transition(&old.job_id, JobState::Failed, TransitionUpdate::default())
            .unwrap();
        let active = reg.create(spec("b.mp4")).unwrap();

        let removed = reg.prune(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].job_id, old.job_id);
        assert!(reg.get(&active.job_id).is_ok());
        assert!(!dir.path().join(format!("{}.json", old.job_id)).exists());
    }

    #[test]
    fn test_find_succeeded_requires_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::in_memory();
        let job = running(&reg, "a.mp4");
        let output = dir.path().join("out.mp4");
        reg.transition(
            &job.job_id,
            JobState::Succeeded,
            TransitionUpdate {
                output_path: Some(output.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(reg.find_succeeded(&spec("a.mp4")).is_none());
        std::fs::write(&output, "video").unwrap();
        assert_eq!(reg.find_succeeded(&spec("a.mp4")).unwrap().job_id, job.job_id);
        assert!(reg
            .find_succeeded(&EditSpec::new("a.mp4", vec![Segment::new(0.0, 5.0)], ""))
            .is_none());
    }

    #[test]
    fn test_playback_copies_share_single_flight_but_are_not_reused_as_edits() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::in_memory();
        let copy = reg.create_with_kind(spec("a.mp4"), JobKind::Compat).unwrap();
        assert_eq!(copy.kind, JobKind::Compat);
        assert!(matches!(reg.create(spec("a.mp4")), Err(ClipError::AlreadyActive { .. })));

        let output = dir.path().join("a_transcoded.mp4");
        std::fs::write(&output, "video").unwrap();
        reg.transition(&copy.job_id, JobState::Running, TransitionUpdate::default())
            .unwrap();
        reg.transition(
            &copy.job_id,
            JobState::Succeeded,
            TransitionUpdate {
                output_path: Some(output),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(reg.find_succeeded(&spec("a.mp4")).is_none());
    }

    #[test]
    fn test_reopen_marks_running_failed_and_keeps_queued() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let output = out_dir.path().join("clip.mp4");
        let temp = temp_output_path(&output);
        std::fs::write(&temp, "partial").unwrap();

        let (queued_id, running_id) = {
            let (reg, _) = JobRegistry::open(dir.path()).unwrap();
            let queued = reg.create(spec("q.mp4")).unwrap();
            let run = reg.create(spec("r.mp4")).unwrap();
            reg.transition(
                &run.job_id,
                JobState::Running,
                TransitionUpdate {
                    output_path: Some(output.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
            (queued.job_id, run.job_id)
        };

        let (reg, report) = JobRegistry::open(dir.path()).unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.temp_removed, 1);
        assert_eq!(report.queued, 1);
        assert!(!temp.exists());

        let failed = reg.get(&running_id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.error.unwrap().contains("restart"));
        assert_eq!(reg.get(&queued_id).unwrap().state, JobState::Queued);
        assert_eq!(reg.active_job_for("q.mp4"), Some(queued_id));
        assert!(reg.active_job_for("r.mp4").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_reopen_kills_orphaned_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        {
            let (reg, _) = JobRegistry::open(dir.path()).unwrap();
            let job = reg.create(spec("a.mp4")).unwrap();
            reg.transition(
                &job.job_id,
                JobState::Running,
                TransitionUpdate {
                    pid: Some(child.id()),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let (_reg, report) = JobRegistry::open(dir.path()).unwrap();
        assert_eq!(report.killed, 1);
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
