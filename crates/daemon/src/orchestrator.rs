//! Transcode orchestrator.
//!
//! Callers submit, poll and cancel through `Orchestrator`. A single event
//! loop owns the FIFO queue and the set of running transcodes; every
//! progress report and completion reaches the registry through that loop,
//! so transitions for one job are applied in order.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, VideoRef};
use crate::compat::{compat_path, full_length_spec, is_fresh, CompatStatus};
use crate::config::VidclipConfig;
use crate::edit::{EditSpec, Segment};
use crate::error::{ClipError, ClipResult};
use crate::history::HistoryStore;
use crate::job::{Job, JobId, JobKind, JobState, JobStatus};
use crate::registry::{JobRegistry, TransitionUpdate};
use crate::runner::{Canceller, JobHandle, ProcessRunner, RunOutcome};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Outputs go to `<edits_dir>/<job_id>/<output name>`
    pub edits_dir: PathBuf,
    /// Playback copies go to `compat::compat_path(compat_dir, video_id)`
    pub compat_dir: PathBuf,
    pub max_concurrent_jobs: usize,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &VidclipConfig) -> Self {
        OrchestratorSettings {
            edits_dir: cfg.edits_dir(),
            compat_dir: cfg.compat_dir(),
            max_concurrent_jobs: cfg.max_concurrent_jobs,
        }
    }
}

enum Event {
    Enqueue { job_id: JobId, video: VideoRef },
    Progress { job_id: JobId, percent: f64 },
    Finished { job_id: JobId, result: ClipResult<RunOutcome> },
    Cancel { job_id: JobId },
    Shutdown { done: oneshot::Sender<()> },
}

/// Handle to the orchestrator; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    catalog: Arc<Catalog>,
    history: Option<Arc<HistoryStore>>,
    compat_dir: PathBuf,
    events: mpsc::UnboundedSender<Event>,
    event_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Orchestrator {
    /// Start the event loop. Must be called inside a tokio runtime.
    pub fn start(
        registry: Arc<JobRegistry>,
        catalog: Arc<Catalog>,
        runner: ProcessRunner,
        history: Option<Arc<HistoryStore>>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            registry: Arc::clone(&registry),
            runner,
            history: history.clone(),
            edits_dir: settings.edits_dir,
            compat_dir: settings.compat_dir.clone(),
            max_concurrent: settings.max_concurrent_jobs.max(1),
            queue: VecDeque::new(),
            running: HashMap::new(),
            events: events.clone(),
            shutdown_waiters: Vec::new(),
        };
        let handle = tokio::spawn(event_loop.run(rx));

        Orchestrator {
            registry,
            catalog,
            history,
            compat_dir: settings.compat_dir,
            events,
            event_loop: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate and queue an edit; returns the job id.
    ///
    /// An identical edit that already succeeded, and whose output is still
    /// on disk, returns the existing job id without starting anything.
    pub async fn submit_edit(&self, spec: EditSpec) -> ClipResult<JobId> {
        let video = self.catalog.resolve(&spec.video_id).await?;
        self.submit_resolved(spec, video)
    }

    /// Submit an edit given as regions to remove from the video
    pub async fn submit_cut(
        &self,
        video_id: &str,
        removed: &[Segment],
        output_name: &str,
    ) -> ClipResult<JobId> {
        let video = self.catalog.resolve(video_id).await?;
        let spec = EditSpec::from_removed_regions(video_id, removed, video.duration_seconds, output_name)?;
        self.submit_resolved(spec, video)
    }

    fn submit_resolved(&self, spec: EditSpec, video: VideoRef) -> ClipResult<JobId> {
        spec.validate(video.duration_seconds)?;

        if let Some(done) = self.registry.find_succeeded(&spec) {
            info!("Job {}: reusing finished output for {}", done.job_id, spec.video_id);
            return Ok(done.job_id);
        }

        let job = self.registry.create(spec)?;
        info!(
            "Job {}: queued edit of {} ({} segments)",
            job.job_id,
            job.video_id,
            job.edit_spec.segments.len()
        );
        self.enqueue(&job, video)?;
        Ok(job.job_id)
    }

    /// Return the playback copy of a video, queueing a transcode when the
    /// cached copy is missing or older than the source.
    ///
    /// A request while the copy is being made returns the same job. A video
    /// with an edit in progress gets `AlreadyActive`.
    pub async fn request_compat(&self, video_id: &str) -> ClipResult<CompatStatus> {
        let video = self.catalog.resolve(video_id).await?;
        let path = compat_path(&self.compat_dir, &video.id)?;
        if is_fresh(&video.absolute_path, &path) {
            debug!("Playback copy of {} is up to date", video.id);
            return Ok(CompatStatus::Ready { path });
        }

        let spec = full_length_spec(&video.id, video.duration_seconds);
        spec.validate(video.duration_seconds)?;
        match self.registry.create_with_kind(spec, JobKind::Compat) {
            Ok(job) => {
                info!("Job {}: queued playback copy of {}", job.job_id, job.video_id);
                self.enqueue(&job, video)?;
                Ok(CompatStatus::Pending { job_id: job.job_id })
            }
            Err(ClipError::AlreadyActive { video_id, job_id }) => match self.registry.get(&job_id) {
                Ok(active) if active.kind == JobKind::Compat => Ok(CompatStatus::Pending { job_id }),
                _ => Err(ClipError::AlreadyActive { video_id, job_id }),
            },
            Err(e) => Err(e),
        }
    }

    /// Delete a source video together with its playback copy and history.
    ///
    /// Refused while any job for the video is active.
    pub fn delete_video(&self, video_id: &str) -> ClipResult<()> {
        let source = self.catalog.locate(video_id)?;
        if let Some(job_id) = self.registry.active_job_for(video_id) {
            return Err(ClipError::AlreadyActive {
                video_id: video_id.to_string(),
                job_id,
            });
        }

        std::fs::remove_file(&source)?;
        info!("🗑️  Deleted video {}", source.display());

        let copy = compat_path(&self.compat_dir, video_id)?;
        match std::fs::remove_file(&copy) {
            Ok(()) => debug!("Deleted playback copy {}", copy.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete playback copy {}: {}", copy.display(), e),
        }

        if let Some(history) = &self.history {
            history.remove(video_id)?;
        }
        Ok(())
    }

    fn enqueue(&self, job: &Job, video: VideoRef) -> ClipResult<()> {
        let sent = self.events.send(Event::Enqueue {
            job_id: job.job_id.clone(),
            video,
        });
        if sent.is_err() {
            warn!("Job {}: orchestrator is stopped, failing job", job.job_id);
            self.registry.transition(
                &job.job_id,
                JobState::Failed,
                TransitionUpdate {
                    error: Some("orchestrator stopped".to_string()),
                    ..Default::default()
                },
            )?;
            return Err(ClipError::Cancelled);
        }
        Ok(())
    }

    pub fn poll_progress(&self, job_id: &str) -> ClipResult<JobStatus> {
        self.registry.status(job_id)
    }

    /// Cancel a job.
    ///
    /// A queued job is cancelled at once. A running job reports `cancelled`
    /// right away but stays active until its process has exited.
    pub fn cancel_edit(&self, job_id: &str) -> ClipResult<()> {
        let before = self.registry.request_cancel(job_id)?;
        if before.state == JobState::Queued {
            match self.registry.transition(job_id, JobState::Cancelled, TransitionUpdate::default()) {
                Ok(_) => {
                    info!("Job {}: cancelled while queued", job_id);
                    return Ok(());
                }
                // started between the two calls
                Err(ClipError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Job {}: cancel requested", job_id);
        let _ = self.events.send(Event::Cancel {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Status of every known job, oldest first
    pub fn list_jobs(&self) -> Vec<JobStatus> {
        self.registry.snapshot().iter().map(Job::status).collect()
    }

    /// Re-dispatch jobs left queued by a previous run.
    ///
    /// Each video is resolved again; a job whose video is gone is marked
    /// Failed. Returns the number of jobs queued.
    pub async fn resume(&self) -> usize {
        let mut resumed = 0;
        for job in self.registry.queued() {
            match self.catalog.resolve(&job.video_id).await {
                Ok(video) => {
                    if self.enqueue(&job, video).is_ok() {
                        resumed += 1;
                    }
                }
                Err(e) => {
                    warn!("Job {}: cannot resume, {}", job.job_id, e);
                    if let Err(e) = self.registry.transition(
                        &job.job_id,
                        JobState::Failed,
                        TransitionUpdate {
                            error: Some(e.to_string()),
                            ..Default::default()
                        },
                    ) {
                        error!("Job {}: {}", job.job_id, e);
                    }
                }
            }
        }
        if resumed > 0 {
            info!("🔄 Resumed {} queued job(s)", resumed);
        }
        resumed
    }

    /// Cancel running transcodes and wait for them to exit.
    ///
    /// Queued jobs are left queued so the next start picks them up.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.events.send(Event::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Orchestrator loop ended abnormally: {}", e);
            }
        }
    }
}

struct EventLoop {
    registry: Arc<JobRegistry>,
    runner: ProcessRunner,
    history: Option<Arc<HistoryStore>>,
    edits_dir: PathBuf,
    compat_dir: PathBuf,
    max_concurrent: usize,
    queue: VecDeque<(JobId, VideoRef)>,
    running: HashMap<JobId, Canceller>,
    events: mpsc::UnboundedSender<Event>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Enqueue { job_id, video } => {
                    self.queue.push_back((job_id, video));
                    self.dispatch();
                }
                Event::Progress { job_id, percent } => {
                    if let Err(e) = self.registry.record_progress(&job_id, percent) {
                        debug!("Job {}: progress dropped: {}", job_id, e);
                    }
                }
                Event::Finished { job_id, result } => {
                    self.running.remove(&job_id);
                    self.finish(&job_id, result);
                    self.dispatch();
                }
                Event::Cancel { job_id } => {
                    if let Some(canceller) = self.running.get(&job_id) {
                        canceller.cancel();
                    }
                }
                Event::Shutdown { done } => {
                    info!(
                        "Orchestrator shutting down: cancelling {} running job(s), {} stay queued",
                        self.running.len(),
                        self.queue.len()
                    );
                    for canceller in self.running.values() {
                        canceller.cancel();
                    }
                    self.shutdown_waiters.push(done);
                }
            }

            if !self.shutdown_waiters.is_empty() && self.running.is_empty() {
                for done in self.shutdown_waiters.drain(..) {
                    let _ = done.send(());
                }
                break;
            }
        }
        debug!("Orchestrator loop stopped");
    }

    /// Start queued jobs while there are free slots
    fn dispatch(&mut self) {
        while self.shutdown_waiters.is_empty() && self.running.len() < self.max_concurrent {
            let Some((job_id, video)) = self.queue.pop_front() else {
                break;
            };
            self.start(job_id, video);
        }
        if !self.queue.is_empty() {
            debug!(
                "{} job(s) running, {} waiting for a slot",
                self.running.len(),
                self.queue.len()
            );
        }
    }

    fn start(&mut self, job_id: JobId, video: VideoRef) {
        let job = match self.registry.get(&job_id) {
            Ok(job) if job.state == JobState::Queued => job,
            _ => return,
        };
        if job.cancel_requested {
            let _ = self.registry.transition(&job_id, JobState::Cancelled, TransitionUpdate::default());
            return;
        }

        let output_path = match job.kind {
            JobKind::Edit => self
                .edits_dir
                .join(&job.job_id)
                .join(job.edit_spec.output_file_name()),
            JobKind::Compat => match compat_path(&self.compat_dir, &job.video_id) {
                Ok(path) => path,
                Err(e) => {
                    self.fail(&job_id, &e);
                    return;
                }
            },
        };
        if let Err(e) = self.registry.transition(
            &job_id,
            JobState::Running,
            TransitionUpdate {
                output_path: Some(output_path.clone()),
                source_path: Some(video.absolute_path.clone()),
                ..Default::default()
            },
        ) {
            error!("Job {}: could not start: {}", job_id, e);
            return;
        }

        let launched = match job.kind {
            JobKind::Edit => self.runner.launch(&video, &job.edit_spec, &output_path),
            JobKind::Compat => self.runner.launch_compat(&video, &output_path),
        };
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                error!("❌ Job {} failed to launch: {}", job_id, e);
                self.remove_job_dir(&job);
                self.fail(&job_id, &e);
                return;
            }
        };

        if let Some(pid) = handle.pid() {
            let _ = self.registry.transition(
                &job_id,
                JobState::Running,
                TransitionUpdate {
                    pid: Some(pid),
                    ..Default::default()
                },
            );
        }
        info!("Starting transcoding job {}: {}", job_id, video.absolute_path.display());

        let canceller = handle.canceller();
        if self.registry.get(&job_id).map(|j| j.cancel_requested).unwrap_or(false) {
            canceller.cancel();
        }
        self.running.insert(job_id.clone(), canceller);
        tokio::spawn(forward_events(job_id, handle, self.events.clone()));
    }

    fn finish(&mut self, job_id: &str, result: ClipResult<RunOutcome>) {
        let job = match self.registry.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                error!("Job {}: finished but {}", job_id, e);
                return;
            }
        };

        match result {
            Ok(RunOutcome::Succeeded(path)) if job.cancel_requested => {
                info!("Job {}: finished after cancel, discarding output", job_id);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Job {}: failed to remove {}: {}", job_id, path.display(), e);
                }
                self.remove_job_dir(&job);
                let _ = self.registry.transition(job_id, JobState::Cancelled, TransitionUpdate::default());
            }
            Ok(RunOutcome::Succeeded(path)) => {
                info!("✅ Job {} completed successfully: {}", job_id, path.display());
                let _ = self.registry.transition(
                    job_id,
                    JobState::Succeeded,
                    TransitionUpdate {
                        output_path: Some(path),
                        ..Default::default()
                    },
                );
                if let (JobKind::Edit, Some(history)) = (job.kind, &self.history) {
                    let history = Arc::clone(history);
                    let job_id = job_id.to_string();
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = history.record_edit(&job.video_id, &job.edit_spec) {
                            warn!("Job {}: failed to record edit in history: {}", job_id, e);
                        }
                    });
                }
            }
            Ok(RunOutcome::Cancelled) | Err(ClipError::Cancelled) => {
                info!("Job {}: cancelled", job_id);
                self.remove_job_dir(&job);
                let _ = self.registry.transition(job_id, JobState::Cancelled, TransitionUpdate::default());
            }
            Err(e) => {
                error!("❌ Job {} failed: {}", job_id, e);
                self.remove_job_dir(&job);
                self.fail(job_id, &e);
            }
        }
    }

    fn fail(&self, job_id: &str, e: &ClipError) {
        if let Err(te) = self.registry.transition(
            job_id,
            JobState::Failed,
            TransitionUpdate {
                error: Some(e.to_string()),
                ..Default::default()
            },
        ) {
            error!("Job {}: {}", job_id, te);
        }
    }

    /// Remove the job's output directory if nothing is left in it
    fn remove_job_dir(&self, job: &Job) {
        if job.kind == JobKind::Compat {
            return;
        }
        let dir = self.edits_dir.join(&job.job_id);
        if dir.is_dir() {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

/// Relay a transcode's progress and result into the event loop
async fn forward_events(job_id: JobId, mut handle: JobHandle, events: mpsc::UnboundedSender<Event>) {
    while let Some(percent) = handle.next_progress().await {
        let _ = events.send(Event::Progress {
            job_id: job_id.clone(),
            percent,
        });
    }
    let result = handle.result().await;
    let _ = events.send(Event::Finished { job_id, result });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompatSettings, EncoderSettings};
    use crate::config::VideoRoot;
    use crate::edit::Segment;
    use crate::probe::DurationProbe;
    use crate::runner::RunnerSettings;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    struct FixedDuration(f64);

    #[async_trait]
    impl DurationProbe for FixedDuration {
        async fn duration_secs(&self, _path: &Path) -> ClipResult<f64> {
            Ok(self.0)
        }
    }

    struct Fixture {
        videos: tempfile::TempDir,
        cache: tempfile::TempDir,
        orchestrator: Orchestrator,
    }

    /// Orchestrator over one video, `clip.mp4`, of 120s and a missing transcoder
    fn fixture() -> Fixture {
        let videos = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(videos.path().join("clip.mp4"), b"x").unwrap();
        let catalog = Catalog::new(
            vec![VideoRoot {
                name: "videos".into(),
                path: videos.path().to_path_buf(),
            }],
            cache.path().join("thumbnails"),
            Arc::new(FixedDuration(120.0)),
        );
        let runner = ProcessRunner::new(RunnerSettings {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-for-vidclip-tests"),
            encoder: EncoderSettings::default(),
            compat: CompatSettings::default(),
            stall_timeout: Duration::from_secs(5),
            cancel_grace: Duration::from_millis(100),
        });
        let orchestrator = Orchestrator::start(
            Arc::new(JobRegistry::in_memory()),
            Arc::new(catalog),
            runner,
            None,
            OrchestratorSettings {
                edits_dir: cache.path().join("edits"),
                compat_dir: cache.path().join("compat"),
                max_concurrent_jobs: 1,
            },
        );
        Fixture {
            videos,
            cache,
            orchestrator,
        }
    }

    async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> JobStatus {
        for _ in 0..200 {
            let job = orchestrator.registry().get(job_id).unwrap();
            if job.state.is_terminal() {
                return job.status();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_invalid_spec_creates_no_job() {
        let f = fixture();
        let spec = EditSpec::new("clip.mp4", vec![Segment::new(100.0, 130.0)], "");
        let err = f.orchestrator.submit_edit(spec).await.unwrap_err();
        assert!(matches!(err, ClipError::Validation(_)));
        assert!(f.orchestrator.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_video_and_escape() {
        let f = fixture();
        let missing = EditSpec::new("other.mp4", vec![Segment::new(0.0, 1.0)], "");
        assert!(matches!(
            f.orchestrator.submit_edit(missing).await,
            Err(ClipError::NotFound(_))
        ));
        let escape = EditSpec::new("../clip.mp4", vec![Segment::new(0.0, 1.0)], "");
        assert!(matches!(
            f.orchestrator.submit_edit(escape).await,
            Err(ClipError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_marks_job_failed() {
        let f = fixture();
        let spec = EditSpec::new("clip.mp4", vec![Segment::new(0.0, 10.0)], "");
        let job_id = f.orchestrator.submit_edit(spec).await.unwrap();
        let status = wait_terminal(&f.orchestrator, &job_id).await;
        assert_eq!(status.state, JobState::Failed);
        assert!(status.error.unwrap().contains("failed to spawn"));
        assert!(!f.cache.path().join("edits").join(&job_id).exists());
    }

    #[tokio::test]
    async fn test_poll_and_cancel_unknown_job() {
        let f = fixture();
        assert!(matches!(f.orchestrator.poll_progress("nope"), Err(ClipError::NotFound(_))));
        assert!(matches!(f.orchestrator.cancel_edit("nope"), Err(ClipError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_rejected() {
        let f = fixture();
        let spec = EditSpec::new("clip.mp4", vec![Segment::new(0.0, 10.0)], "");
        let job_id = f.orchestrator.submit_edit(spec).await.unwrap();
        wait_terminal(&f.orchestrator, &job_id).await;
        assert!(matches!(
            f.orchestrator.cancel_edit(&job_id),
            Err(ClipError::AlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails_job() {
        let f = fixture();
        f.orchestrator.shutdown().await;
        let spec = EditSpec::new("clip.mp4", vec![Segment::new(0.0, 10.0)], "");
        assert!(f.orchestrator.submit_edit(spec).await.is_err());
        let jobs = f.orchestrator.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_fresh_playback_copy_is_ready_without_a_job() {
        let f = fixture();
        let copy = f.cache.path().join("compat").join("clip_transcoded.mp4");
        std::fs::create_dir_all(copy.parent().unwrap()).unwrap();
        std::fs::write(&copy, b"copy").unwrap();

        let status = f.orchestrator.request_compat("clip.mp4").await.unwrap();
        assert_eq!(status, CompatStatus::Ready { path: copy });
        assert!(f.orchestrator.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_playback_copy_keeps_compat_dir() {
        let f = fixture();
        let CompatStatus::Pending { job_id } = f.orchestrator.request_compat("clip.mp4").await.unwrap() else {
            panic!("expected a queued playback copy");
        };
        let status = wait_terminal(&f.orchestrator, &job_id).await;
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.kind, JobKind::Compat);
        assert!(f.cache.path().join("compat").is_dir());
    }

    #[tokio::test]
    async fn test_active_edit_blocks_playback_copy_and_delete() {
        let f = fixture();
        let edit = f
            .orchestrator
            .registry()
            .create(EditSpec::new("clip.mp4", vec![Segment::new(0.0, 10.0)], ""))
            .unwrap();

        assert!(matches!(
            f.orchestrator.request_compat("clip.mp4").await,
            Err(ClipError::AlreadyActive { job_id, .. }) if job_id == edit.job_id
        ));
        assert!(matches!(
            f.orchestrator.delete_video("clip.mp4"),
            Err(ClipError::AlreadyActive { .. })
        ));
        assert!(f.videos.path().join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_or_escaping_video() {
        let f = fixture();
        assert!(matches!(f.orchestrator.delete_video("gone.mp4"), Err(ClipError::NotFound(_))));
        assert!(matches!(
            f.orchestrator.delete_video("../clip.mp4"),
            Err(ClipError::PathEscape(_))
        ));
    }
}
