use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A named, allow-listed folder of videos
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRoot {
    /// Display name, also used as a folder filter
    pub name: String,
    /// Directory containing video files
    pub path: PathBuf,
}

/// Encode settings applied to every edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    /// Trim and keep the first audio stream alongside the video
    pub include_audio: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "fast".to_string(),
            crf: 23,
            pixel_format: "yuv420p".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps: 128,
            include_audio: true,
        }
    }
}

/// Encode settings for full-length playback copies of videos browsers and
/// phones cannot play directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatSettings {
    pub profile: String,
    pub level: String,
    pub max_rate: String,
    pub buf_size: String,
    pub audio_sample_rate: u32,
}

impl Default for CompatSettings {
    fn default() -> Self {
        Self {
            profile: "baseline".to_string(),
            level: "3.0".to_string(),
            max_rate: "2M".to_string(),
            buf_size: "4M".to_string(),
            audio_sample_rate: 44100,
        }
    }
}

/// Configuration for the vidclip daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VidclipConfig {
    /// Video folders the catalog may serve from
    pub video_roots: Vec<VideoRoot>,
    /// Cache directory holding edit outputs and thumbnails
    pub cache_dir: PathBuf,
    /// Thumbnail directory; defaults to `<cache_dir>/thumbnails`
    pub thumbnail_dir: Option<PathBuf>,
    /// Directory for job state files, history and the command inbox
    pub state_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Maximum number of transcodes running at once
    pub max_concurrent_jobs: usize,
    /// Seconds without a progress line before a transcode is killed
    pub stall_timeout_secs: u64,
    /// Seconds a cancelled transcode gets to exit before it is killed
    pub cancel_grace_secs: u64,
    /// Seconds terminal jobs are kept before pruning
    pub job_retention_secs: u64,
    /// Interval in seconds between cache sweeps
    pub sweep_interval_secs: u64,
    /// Maximum number of history records kept
    pub history_limit: usize,
    pub encoder: EncoderSettings,
    /// Extra settings for playback copies; codec, preset and crf come from `encoder`
    pub compat: CompatSettings,
}

impl Default for VidclipConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl VidclipConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            video_roots: Vec::new(),
            cache_dir: PathBuf::from("cache"),
            thumbnail_dir: None,
            state_dir: PathBuf::from("state"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            max_concurrent_jobs: 2,
            stall_timeout_secs: 120,
            cancel_grace_secs: 5,
            job_retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 600,
            history_limit: 50,
            encoder: EncoderSettings::default(),
            compat: CompatSettings::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be at least 1");
        }
        if self.stall_timeout_secs == 0 {
            bail!("stall_timeout_secs must be at least 1");
        }
        let mut names = std::collections::HashSet::new();
        for root in &self.video_roots {
            if !names.insert(root.name.as_str()) {
                bail!("duplicate video root name: {}", root.name);
            }
        }
        Ok(())
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.thumbnail_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("thumbnails"))
    }

    /// Directory edit outputs are written under, one subdirectory per job
    pub fn edits_dir(&self) -> PathBuf {
        self.cache_dir.join("edits")
    }

    /// Directory of cached playback copies, mirroring the video ids
    pub fn compat_dir(&self) -> PathBuf {
        self.cache_dir.join("compat")
    }

    pub fn job_state_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn command_dir(&self) -> PathBuf {
        self.state_dir.join("commands")
    }

    pub fn history_file(&self) -> PathBuf {
        self.state_dir.join("history.json")
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
