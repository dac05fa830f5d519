use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::error::{ClipError, ClipResult};

/// Source of a video's duration in seconds.
///
/// The catalog calls this once per resolve; nothing is cached because the
/// file may be replaced between requests.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_secs(&self, path: &Path) -> ClipResult<f64>;
}

/// Asks `ffprobe` for the container duration
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    ffprobe_bin: PathBuf,
}

impl FfprobeDuration {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        FfprobeDuration {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeDuration {
    async fn duration_secs(&self, path: &Path) -> ClipResult<f64> {
        let probe_err = |reason: String| ClipError::Probe {
            path: path.to_path_buf(),
            reason,
        };

        debug!("ffprobe: {} -> duration of {}", self.ffprobe_bin.display(), path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| probe_err(format!("failed to execute {}: {}", self.ffprobe_bin.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(probe_err(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        parse_duration_output(&String::from_utf8_lossy(&output.stdout)).map_err(probe_err)
    }
}

/// Parse the single `format=duration` value printed by ffprobe
pub fn parse_duration_output(stdout: &str) -> Result<f64, String> {
    let value = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| "ffprobe printed no duration".to_string())?;

    let secs: f64 = value
        .parse()
        .map_err(|_| format!("unparseable duration: {}", value))?;

    if secs.is_finite() && secs > 0.0 {
        Ok(secs)
    } else {
        Err(format!("unusable duration: {}", value))
    }
}
