//! Video catalog: lists the files under the configured roots and resolves a
//! requested video id to a canonical path that provably stays inside one of
//! them.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;
use crate::config::{VidclipConfig, VideoRoot};
use crate::error::{ClipError, ClipResult};
use crate::probe::DurationProbe;

/// Video file extensions the catalog recognizes
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "avi", "mkv", "webm", "flv", "f4v", "wmv", "asf",
    "mpg", "mpeg", "mpe", "m2v", "m4p", "ts", "mts", "m2ts", "3gp", "3g2",
    "ogv", "ogg", "ogm", "vob", "rm", "rmvb", "divx", "mxf", "mod", "tod",
    "dat", "qt", "dv", "amv",
];

/// A resolved, validated source video
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRef {
    pub id: String,
    pub absolute_path: PathBuf,
    pub duration_seconds: f64,
}

/// One video file found by a catalog listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Path relative to its root, `/`-separated
    pub id: String,
    pub name: String,
    /// Name of the root the file lives under
    pub folder: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub extension: String,
}

/// Per-root video count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSummary {
    pub name: String,
    pub path: PathBuf,
    pub count: usize,
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Join a relative video id onto `root` without leaving it.
///
/// Only plain name components are accepted; absolute paths, `..`, and
/// drive/root prefixes fail with `PathEscape`. The filesystem is not
/// consulted, so symlinks are checked separately by `Catalog::locate`.
pub fn safe_join(root: &Path, relative: &str) -> ClipResult<PathBuf> {
    if relative.trim().is_empty() {
        return Err(ClipError::PathEscape("empty video id".to_string()));
    }

    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ClipError::PathEscape(relative.to_string()));
            }
        }
    }

    if depth == 0 {
        return Err(ClipError::PathEscape(relative.to_string()));
    }
    Ok(joined)
}

/// Read-only view of the configured video roots
pub struct Catalog {
    roots: Vec<VideoRoot>,
    thumbnail_dir: PathBuf,
    probe: Arc<dyn DurationProbe>,
}

impl Catalog {
    pub fn new(roots: Vec<VideoRoot>, thumbnail_dir: PathBuf, probe: Arc<dyn DurationProbe>) -> Self {
        Catalog {
            roots,
            thumbnail_dir,
            probe,
        }
    }

    pub fn from_config(cfg: &VidclipConfig, probe: Arc<dyn DurationProbe>) -> Self {
        Self::new(cfg.video_roots.clone(), cfg.thumbnail_dir(), probe)
    }

    /// Find the canonical path of `video_id`, trying roots in order.
    pub fn locate(&self, video_id: &str) -> ClipResult<PathBuf> {
        for root in &self.roots {
            let candidate = safe_join(&root.path, video_id)?;
            if !candidate.is_file() {
                continue;
            }

            let canonical_root = match root.path.canonicalize() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Video root {} cannot be canonicalized: {}", root.path.display(), e);
                    continue;
                }
            };
            let canonical = candidate.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                warn!(
                    "Rejected {}: resolves to {} outside root {}",
                    video_id,
                    canonical.display(),
                    canonical_root.display()
                );
                return Err(ClipError::PathEscape(video_id.to_string()));
            }
            if !is_video_file(&canonical) {
                return Err(ClipError::NotFound(format!("{} is not a video file", video_id)));
            }
            return Ok(canonical);
        }

        Err(ClipError::NotFound(format!("video {}", video_id)))
    }

    /// Resolve `video_id` to a `VideoRef`, probing its duration.
    pub async fn resolve(&self, video_id: &str) -> ClipResult<VideoRef> {
        let absolute_path = self.locate(video_id)?;
        let duration_seconds = self.probe.duration_secs(&absolute_path).await?;
        debug!("Resolved {} -> {} ({:.2}s)", video_id, absolute_path.display(), duration_seconds);
        Ok(VideoRef {
            id: video_id.to_string(),
            absolute_path,
            duration_seconds,
        })
    }

    /// List video files under every root, newest first.
    ///
    /// `folders` restricts the listing to roots with those names; `None` or
    /// an empty slice lists everything. Missing roots are skipped.
    pub fn list(&self, folders: Option<&[String]>) -> Vec<CatalogEntry> {
        let mut entries = Vec::new();

        for root in &self.roots {
            if let Some(filter) = folders {
                if !filter.is_empty() && !filter.iter().any(|f| f == &root.name) {
                    continue;
                }
            }
            if !root.path.exists() {
                warn!("Video root does not exist: {}", root.path.display());
                continue;
            }

            for entry in WalkDir::new(&root.path).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !is_video_file(entry.path()) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root.path) else {
                    continue;
                };
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Failed to stat {}: {}", entry.path().display(), e);
                        continue;
                    }
                };

                let id = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                let extension = entry
                    .path()
                    .extension()
                    .and_then(|s| s.to_str())
                    .map(|s| format!(".{}", s.to_lowercase()))
                    .unwrap_or_default();

                entries.push(CatalogEntry {
                    id,
                    name: entry.file_name().to_string_lossy().to_string(),
                    folder: root.name.clone(),
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                    modified,
                    extension,
                });
            }
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id)));
        debug!("Catalog listing found {} videos", entries.len());
        entries
    }

    /// Like `list(None)`, but fails if any root cannot be read.
    ///
    /// Callers that delete files based on what is *not* listed must use this
    /// so an unmounted root does not look like an empty one.
    pub fn try_list(&self) -> ClipResult<Vec<CatalogEntry>> {
        for root in &self.roots {
            std::fs::read_dir(&root.path).map_err(|e| {
                ClipError::NotFound(format!("video root {} ({}): {}", root.name, root.path.display(), e))
            })?;
        }
        Ok(self.list(None))
    }

    /// Number of videos under each root
    pub fn folder_summaries(&self) -> Vec<FolderSummary> {
        let all = self.list(None);
        let summaries: Vec<FolderSummary> = self
            .roots
            .iter()
            .map(|root| FolderSummary {
                name: root.name.clone(),
                path: root.path.clone(),
                count: all.iter().filter(|e| e.folder == root.name).count(),
            })
            .collect();
        info!("Catalog has {} videos across {} folders", all.len(), summaries.len());
        summaries
    }

    pub fn thumbnail_dir(&self) -> &Path {
        &self.thumbnail_dir
    }

    /// Where the thumbnail for `video_id` is cached
    pub fn thumbnail_path(&self, video_id: &str) -> PathBuf {
        self.thumbnail_dir.join(video_id).with_extension("jpg")
    }
}
