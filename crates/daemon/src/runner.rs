//! Transcoder process runner.
//!
//! Spawns ffmpeg for one edit, reads `-progress pipe:1` output from stdout
//! on the supervising task, keeps a short tail of stderr for error reports,
//! and publishes the output with a rename once the process exits cleanly.
//! Cancellation asks ffmpeg to quit through stdin (`q`), then kills it after
//! the grace period.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::catalog::VideoRef;
use crate::config::{CompatSettings, EncoderSettings, VidclipConfig};
use crate::edit::EditSpec;
use crate::error::{ClipError, ClipResult};
use crate::progress::{FfmpegProgressParser, ProgressParser, ProgressTracker};

/// Lines of stderr kept for `TranscodeFailed`
const STDERR_TAIL_LINES: usize = 20;
/// How long to keep reading progress after the process has exited
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(250);

/// Marker inside temp output names
pub const TEMP_MARKER: &str = ".tmp.";

/// How a finished run ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Output was published at this path
    Succeeded(PathBuf),
    /// The run was cancelled and its partial output removed
    Cancelled,
}

/// Settings the runner needs from the daemon configuration
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub ffmpeg_bin: PathBuf,
    pub encoder: EncoderSettings,
    pub compat: CompatSettings,
    pub stall_timeout: Duration,
    pub cancel_grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(cfg: &VidclipConfig) -> Self {
        RunnerSettings {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            encoder: cfg.encoder.clone(),
            compat: cfg.compat.clone(),
            stall_timeout: cfg.stall_timeout(),
            cancel_grace: cfg.cancel_grace(),
        }
    }
}

/// Temp path the transcoder writes to before the output is published.
///
/// `clip.mp4` becomes `clip.tmp.mp4` in the same directory so the final
/// rename never crosses filesystems.
pub fn temp_output_path(final_path: &Path) -> PathBuf {
    let stem = final_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let name = match final_path.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}{}{}", stem, TEMP_MARKER, ext),
        None => format!("{}{}part", stem, TEMP_MARKER),
    };
    final_path.with_file_name(name)
}

pub fn is_temp_output(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(TEMP_MARKER))
        .unwrap_or(false)
}

/// Seconds formatted for ffmpeg filter arguments, without float noise
fn format_secs(secs: f64) -> String {
    let s = format!("{:.6}", secs);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() { "0".to_string() } else { s.to_string() }
}

/// Requests cancellation of a running transcode
#[derive(Debug, Clone, Default)]
pub struct Canceller {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Handle to one running transcode
pub struct JobHandle {
    pid: Option<u32>,
    progress: mpsc::UnboundedReceiver<f64>,
    canceller: Canceller,
    task: JoinHandle<ClipResult<RunOutcome>>,
}

impl JobHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next progress percent; `None` once the process has exited
    pub async fn next_progress(&mut self) -> Option<f64> {
        self.progress.recv().await
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Ask the transcode to stop. Returns immediately; `result` resolves
    /// once the process is gone.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Wait for the process to exit and its output to be published or removed
    pub async fn result(self) -> ClipResult<RunOutcome> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ClipError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("transcode supervisor failed: {}", e),
            ))),
        }
    }

    /// Cancel and wait until the subprocess is no longer running
    pub async fn cancel_and_wait(self) -> ClipResult<RunOutcome> {
        self.cancel();
        self.result().await
    }
}

type ParserFactory = Arc<dyn Fn() -> Box<dyn ProgressParser> + Send + Sync>;

/// Launches transcodes for edit specs
#[derive(Clone)]
pub struct ProcessRunner {
    settings: RunnerSettings,
    parser_factory: ParserFactory,
}

impl ProcessRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        ProcessRunner {
            settings,
            parser_factory: Arc::new(|| Box::new(FfmpegProgressParser)),
        }
    }

    /// Use a different progress parser for transcoders with another output format
    pub fn with_parser<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ProgressParser> + Send + Sync + 'static,
    {
        self.parser_factory = Arc::new(factory);
        self
    }

    /// Build the transcoder argument list for `spec`.
    ///
    /// Each segment becomes one trim (and atrim) chain; the chains are
    /// concatenated in the order given. The output path is always last.
    pub fn build_args(&self, video: &VideoRef, spec: &EditSpec, output: &Path) -> Vec<String> {
        let enc = &self.settings.encoder;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-y".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-i".into(),
            video.absolute_path.to_string_lossy().to_string(),
        ];

        let mut filters = Vec::with_capacity(spec.segments.len() * 2 + 1);
        let mut concat_inputs = String::new();
        for (i, seg) in spec.segments.iter().enumerate() {
            let start = format_secs(seg.start);
            let end = format_secs(seg.end);
            filters.push(format!(
                "[0:v]trim=start={}:end={},setpts=PTS-STARTPTS[v{}]",
                start, end, i
            ));
            concat_inputs.push_str(&format!("[v{}]", i));
            if enc.include_audio {
                filters.push(format!(
                    "[0:a]atrim=start={}:end={},asetpts=PTS-STARTPTS[a{}]",
                    start, end, i
                ));
                concat_inputs.push_str(&format!("[a{}]", i));
            }
        }
        if enc.include_audio {
            filters.push(format!(
                "{}concat=n={}:v=1:a=1[outv][outa]",
                concat_inputs,
                spec.segments.len()
            ));
        } else {
            filters.push(format!(
                "{}concat=n={}:v=1:a=0[outv]",
                concat_inputs,
                spec.segments.len()
            ));
        }

        args.push("-filter_complex".into());
        args.push(filters.join(";"));
        args.push("-map".into());
        args.push("[outv]".into());
        if enc.include_audio {
            args.push("-map".into());
            args.push("[outa]".into());
        }

        args.extend([
            "-c:v".to_string(),
            enc.video_codec.clone(),
            "-preset".to_string(),
            enc.preset.clone(),
            "-crf".to_string(),
            enc.crf.to_string(),
            "-pix_fmt".to_string(),
            enc.pixel_format.clone(),
        ]);
        if enc.include_audio {
            args.extend([
                "-c:a".to_string(),
                enc.audio_codec.clone(),
                "-b:a".to_string(),
                format!("{}k", enc.audio_bitrate_kbps),
            ]);
        }

        let ext = output
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        if matches!(ext.as_deref(), Some("mp4") | Some("m4v") | Some("mov")) {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }

        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Argument list for a full-length playback copy of `video`
    pub fn build_compat_args(&self, video: &VideoRef, output: &Path) -> Vec<String> {
        let enc = &self.settings.encoder;
        let compat = &self.settings.compat;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-y".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-i".into(),
            video.absolute_path.to_string_lossy().to_string(),
            "-c:v".into(),
            enc.video_codec.clone(),
            "-profile:v".into(),
            compat.profile.clone(),
            "-level".into(),
            compat.level.clone(),
            "-preset".into(),
            enc.preset.clone(),
            "-crf".into(),
            enc.crf.to_string(),
            "-maxrate".into(),
            compat.max_rate.clone(),
            "-bufsize".into(),
            compat.buf_size.clone(),
            "-pix_fmt".into(),
            enc.pixel_format.clone(),
        ];
        if enc.include_audio {
            args.extend([
                "-c:a".to_string(),
                enc.audio_codec.clone(),
                "-b:a".to_string(),
                format!("{}k", enc.audio_bitrate_kbps),
                "-ar".to_string(),
                compat.audio_sample_rate.to_string(),
            ]);
        } else {
            args.push("-an".into());
        }
        args.extend([
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Start transcoding `spec` of `video` into `output_path`.
    ///
    /// Fails synchronously only if the process cannot be spawned; everything
    /// after that is reported through the handle.
    pub fn launch(&self, video: &VideoRef, spec: &EditSpec, output_path: &Path) -> ClipResult<JobHandle> {
        let temp_output = prepare_temp_output(output_path)?;
        let args = self.build_args(video, spec, &temp_output);
        info!(
            "Transcode of {} ({} segments, {:.1}s) -> {}",
            video.absolute_path.display(),
            spec.segments.len(),
            spec.output_duration(),
            output_path.display()
        );
        self.spawn(args, spec.output_duration(), temp_output, output_path)
    }

    /// Start a full-length playback copy of `video` into `output_path`
    pub fn launch_compat(&self, video: &VideoRef, output_path: &Path) -> ClipResult<JobHandle> {
        let temp_output = prepare_temp_output(output_path)?;
        let args = self.build_compat_args(video, &temp_output);
        info!(
            "Playback copy of {} ({:.1}s) -> {}",
            video.absolute_path.display(),
            video.duration_seconds,
            output_path.display()
        );
        self.spawn(args, video.duration_seconds, temp_output, output_path)
    }

    fn spawn(
        &self,
        args: Vec<String>,
        total_secs: f64,
        temp_output: PathBuf,
        output_path: &Path,
    ) -> ClipResult<JobHandle> {
        debug!("Spawning {} {:?}", self.settings.ffmpeg_bin.display(), args);

        let mut child = Command::new(&self.settings.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClipError::transcode_failed(
                    None,
                    format!("failed to spawn {}: {}", self.settings.ffmpeg_bin.display(), e),
                )
            })?;

        let pid = child.id();
        debug!("Transcoder started with pid {:?}", pid);

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let canceller = Canceller::default();
        let run = Supervisor {
            stdin: child.stdin.take(),
            parser: (self.parser_factory)(),
            tracker: ProgressTracker::new(total_secs),
            progress_tx,
            canceller: canceller.clone(),
            stall_timeout: self.settings.stall_timeout,
            cancel_grace: self.settings.cancel_grace,
            temp_output,
            final_output: output_path.to_path_buf(),
        };
        let task = tokio::spawn(run.supervise(child));

        Ok(JobHandle {
            pid,
            progress: progress_rx,
            canceller,
            task,
        })
    }
}

/// Make sure the output directory exists and no stale temp file is in the way
fn prepare_temp_output(output_path: &Path) -> ClipResult<PathBuf> {
    let temp_output = temp_output_path(output_path);
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if temp_output.exists() {
        warn!("Removing stale temp output: {}", temp_output.display());
        std::fs::remove_file(&temp_output)?;
    }
    Ok(temp_output)
}

async fn next_stdout_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

enum Exit {
    Finished(ExitStatus),
    Cancelled,
    Stalled,
}

struct Supervisor {
    stdin: Option<ChildStdin>,
    parser: Box<dyn ProgressParser>,
    tracker: ProgressTracker,
    progress_tx: mpsc::UnboundedSender<f64>,
    canceller: Canceller,
    stall_timeout: Duration,
    cancel_grace: Duration,
    temp_output: PathBuf,
    final_output: PathBuf,
}

impl Supervisor {
    fn handle_line(&mut self, line: &str) -> bool {
        match self.parser.parse_line(line) {
            Some(signal) => {
                if let Some(percent) = self.tracker.observe(signal) {
                    let _ = self.progress_tx.send(percent);
                }
                true
            }
            None => false,
        }
    }

    async fn supervise(mut self, mut child: Child) -> ClipResult<RunOutcome> {
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_reader = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = tail.lock();
                    if guard.len() == STDERR_TAIL_LINES {
                        guard.pop_front();
                    }
                    guard.push_back(line);
                }
            })
        });

        let mut lines = stdout.map(|s| BufReader::new(s).lines());
        let mut stdout_open = lines.is_some();
        let mut deadline = Instant::now() + self.stall_timeout;
        let canceller = self.canceller.clone();

        let exit = loop {
            tokio::select! {
                line = next_stdout_line(&mut lines), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            if self.handle_line(&line) {
                                deadline = Instant::now() + self.stall_timeout;
                            }
                        }
                        Ok(None) | Err(_) => stdout_open = false,
                    }
                }
                status = child.wait() => break Exit::Finished(status?),
                _ = canceller.cancelled() => break Exit::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break Exit::Stalled,
            }
        };

        let exit = match exit {
            Exit::Cancelled => {
                self.terminate(&mut child).await?;
                Exit::Cancelled
            }
            Exit::Stalled => {
                warn!(
                    "Transcode made no progress for {:?}, killing pid {:?}",
                    self.stall_timeout,
                    child.id()
                );
                child.kill().await?;
                Exit::Stalled
            }
            finished => finished,
        };

        if stdout_open {
            while let Ok(Ok(Some(line))) = timeout(DRAIN_AFTER_EXIT, next_stdout_line(&mut lines)).await {
                self.handle_line(&line);
            }
        }
        if let Some(reader) = stderr_reader {
            let _ = timeout(DRAIN_AFTER_EXIT, reader).await;
        }
        let tail = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");

        match exit {
            Exit::Stalled => {
                self.discard_temp();
                Err(ClipError::StallTimeout(self.stall_timeout))
            }
            Exit::Cancelled => {
                info!("Transcode cancelled: {}", self.final_output.display());
                self.discard_temp();
                Ok(RunOutcome::Cancelled)
            }
            Exit::Finished(_) if self.canceller.is_cancelled() => {
                info!("Transcode cancelled as it exited: {}", self.final_output.display());
                self.discard_temp();
                Ok(RunOutcome::Cancelled)
            }
            Exit::Finished(status) if status.success() => self.publish(&tail),
            Exit::Finished(status) => {
                self.discard_temp();
                let code = status.code();
                error!("Transcode failed (code={:?}): {}", code, tail.lines().last().unwrap_or(""));
                Err(ClipError::transcode_failed(code, tail))
            }
        }
    }

    /// Ask ffmpeg to quit, then kill it if it is still running after the grace period
    async fn terminate(&mut self, child: &mut Child) -> ClipResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }
        match timeout(self.cancel_grace, child.wait()).await {
            Ok(status) => {
                debug!("Transcode exited after cancel: {:?}", status?);
            }
            Err(_) => {
                warn!(
                    "Transcode pid {:?} ignored quit for {}ms, killing",
                    child.id(),
                    self.cancel_grace.as_millis()
                );
                child.kill().await?;
            }
        }
        Ok(())
    }

    fn publish(&self, stderr_tail: &str) -> ClipResult<RunOutcome> {
        if !self.temp_output.is_file() {
            return Err(ClipError::transcode_failed(
                Some(0),
                format!("transcoder exited without writing output\n{}", stderr_tail),
            ));
        }
        std::fs::rename(&self.temp_output, &self.final_output)?;
        info!("Transcode finished: {}", self.final_output.display());
        Ok(RunOutcome::Succeeded(self.final_output.clone()))
    }

    fn discard_temp(&self) {
        if self.temp_output.exists() {
            if let Err(e) = std::fs::remove_file(&self.temp_output) {
                warn!("Failed to remove temp output {}: {}", self.temp_output.display(), e);
            }
        }
    }
}
