#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vidclip::{
    Catalog, ClipResult, CompatSettings, DurationProbe, EncoderSettings, HistoryRecord, HistoryStore, JobRegistry, JobState,
    JobStatus, MaintenanceScheduler, Orchestrator, OrchestratorSettings, ProcessRunner,
    RecoveryReport, RunnerSettings, VideoRoot,
};

/// Every test video claims to be two minutes long
pub const VIDEO_SECS: f64 = 120.0;

pub struct FixedDuration(pub f64);

#[async_trait]
impl DurationProbe for FixedDuration {
    async fn duration_secs(&self, _path: &Path) -> ClipResult<f64> {
        Ok(self.0)
    }
}

/// How the fake transcoder behaves
#[derive(Debug, Clone, Copy)]
pub enum FakeFfmpeg {
    /// Reports progress and writes the output right away
    Succeed,
    /// Like `Succeed`, after sleeping for a while
    SucceedAfter(f64),
    /// Writes partial output, reports a little progress, then hangs and ignores `q`
    Hang,
    /// Exits non-zero with a message on stderr
    Fail,
}

impl FakeFfmpeg {
    fn body(self) -> String {
        let succeed = r#"echo "out_time_us=0"
echo "progress=continue"
echo "out_time_us=25000000"
echo "progress=continue"
echo "out_time_us=50000000"
echo "progress=end"
printf 'edited' > "$last""#;
        match self {
            FakeFfmpeg::Succeed => succeed.to_string(),
            FakeFfmpeg::SucceedAfter(secs) => format!("sleep {}\n{}", secs, succeed),
            FakeFfmpeg::Hang => r#"printf 'partial' > "$last"
echo "out_time_us=1000000"
echo "progress=continue"
exec sleep 30"#
                .to_string(),
            FakeFfmpeg::Fail => r#"echo "Invalid data found when processing input" >&2
exit 1"#
                .to_string(),
        }
    }
}

/// Scratch directories for one test
pub struct Dirs {
    pub videos: TempDir,
    pub cache: TempDir,
    pub state: TempDir,
    pub bin: TempDir,
}

impl Dirs {
    /// Fresh directories with three source videos: a.mp4, b.mp4, c.mp4
    pub fn new() -> Self {
        let dirs = Dirs {
            videos: tempfile::tempdir().expect("videos dir"),
            cache: tempfile::tempdir().expect("cache dir"),
            state: tempfile::tempdir().expect("state dir"),
            bin: tempfile::tempdir().expect("bin dir"),
        };
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            std::fs::write(dirs.videos.path().join(name), b"source").expect("write video");
        }
        dirs
    }

    pub fn job_state_dir(&self) -> PathBuf {
        self.state.path().join("jobs")
    }

    pub fn edits_dir(&self) -> PathBuf {
        self.cache.path().join("edits")
    }

    pub fn compat_dir(&self) -> PathBuf {
        self.cache.path().join("compat")
    }
}

/// A started orchestrator wired to a fake ffmpeg
pub struct Harness {
    pub dirs: Dirs,
    pub registry: Arc<JobRegistry>,
    pub catalog: Arc<Catalog>,
    pub history: Arc<HistoryStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(fake: FakeFfmpeg, max_concurrent_jobs: usize) -> Self {
        Self::start(Dirs::new(), fake, max_concurrent_jobs).0
    }

    /// Open the registry in `dirs` (running recovery) and start an orchestrator on it
    pub fn start(dirs: Dirs, fake: FakeFfmpeg, max_concurrent_jobs: usize) -> (Self, RecoveryReport) {
        let (registry, report) = JobRegistry::open(&dirs.job_state_dir()).expect("open registry");
        let registry = Arc::new(registry);
        let ffmpeg = write_fake_ffmpeg(dirs.bin.path(), fake);
        let catalog = Arc::new(Catalog::new(
            vec![VideoRoot {
                name: "videos".into(),
                path: dirs.videos.path().to_path_buf(),
            }],
            dirs.cache.path().join("thumbnails"),
            Arc::new(FixedDuration(VIDEO_SECS)),
        ));
        let history = Arc::new(HistoryStore::open(dirs.state.path().join("history.json"), 50));
        let runner = ProcessRunner::new(RunnerSettings {
            ffmpeg_bin: ffmpeg,
            encoder: EncoderSettings::default(),
            compat: CompatSettings::default(),
            stall_timeout: Duration::from_secs(20),
            cancel_grace: Duration::from_millis(200),
        });
        let orchestrator = Orchestrator::start(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            runner,
            Some(Arc::clone(&history)),
            OrchestratorSettings {
                edits_dir: dirs.edits_dir(),
                compat_dir: dirs.compat_dir(),
                max_concurrent_jobs,
            },
        );
        (
            Harness {
                dirs,
                registry,
                catalog,
                history,
                orchestrator,
            },
            report,
        )
    }

    pub fn edits_dir(&self) -> PathBuf {
        self.dirs.edits_dir()
    }

    /// Lines appended by every fake ffmpeg run: its arguments, one per line
    pub fn invocations(&self) -> Vec<Vec<String>> {
        let log = std::fs::read_to_string(self.dirs.bin.path().join("invocations.log")).unwrap_or_default();
        log.split("--end--\n")
            .filter(|chunk| !chunk.trim().is_empty())
            .map(|chunk| chunk.lines().map(str::to_string).collect())
            .collect()
    }

    pub fn scheduler(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.catalog),
            self.edits_dir(),
            self.dirs.compat_dir(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    /// Poll until the job reaches a terminal state
    pub async fn wait_terminal(&self, job_id: &str) -> JobStatus {
        self.wait_for(job_id, |s| s.is_terminal()).await
    }

    /// Poll until the history holds an edit for `video_id`; it is written off the event loop
    pub async fn wait_history_edit(&self, video_id: &str) -> HistoryRecord {
        for _ in 0..500 {
            let record = self.history.get(video_id);
            if record.edit_spec.is_some() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no edit recorded for {}", video_id);
    }

    /// Poll the registry (not the reported state) until `pred` holds
    pub async fn wait_for(&self, job_id: &str, pred: impl Fn(JobState) -> bool) -> JobStatus {
        for _ in 0..1000 {
            let job = self.registry.get(job_id).expect("job exists");
            if pred(job.state) {
                return job.status();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach the expected state", job_id);
    }
}

fn write_fake_ffmpeg(dir: &Path, fake: FakeFfmpeg) -> PathBuf {
    let path = dir.join("ffmpeg");
    let log = dir.join("invocations.log");
    let script = format!(
        "#!/bin/sh\nprintf '%s\\n' \"$@\" >> '{log}'\necho '--end--' >> '{log}'\nfor last; do :; done\n{body}\n",
        log = log.display(),
        body = fake.body()
    );
    std::fs::write(&path, script).expect("write fake ffmpeg");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod fake ffmpeg");
    path
}
