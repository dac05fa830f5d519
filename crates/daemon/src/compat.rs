//! Playback copies.
//!
//! Some sources (HEVC, odd containers, high bitrates) do not play in a
//! browser or on a phone. A playback copy is the whole video re-encoded as
//! baseline H.264/AAC mp4, cached under `<cache_dir>/compat/` at the video's
//! relative path with a `_transcoded.mp4` suffix. A copy older than its
//! source is stale and gets transcoded again on the next request.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::catalog::safe_join;
use crate::edit::{EditSpec, Segment};
use crate::error::ClipResult;
use crate::job::JobId;

pub const COMPAT_SUFFIX: &str = "_transcoded.mp4";

/// Answer to a playback copy request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CompatStatus {
    /// An up to date copy exists
    Ready { path: PathBuf },
    /// A job is producing the copy
    Pending { job_id: JobId },
}

/// Where the playback copy of `video_id` is cached
pub fn compat_path(compat_dir: &Path, video_id: &str) -> ClipResult<PathBuf> {
    let joined = safe_join(compat_dir, video_id)?;
    let stem = joined
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video")
        .to_string();
    Ok(joined.with_file_name(format!("{}{}", stem, COMPAT_SUFFIX)))
}

/// Whether `cached` exists and is at least as new as `source`
pub fn is_fresh(source: &Path, cached: &Path) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified());
    match (modified(source), modified(cached)) {
        (Ok(src), Ok(copy)) => copy >= src,
        _ => false,
    }
}

/// Job spec covering the whole video
pub fn full_length_spec(video_id: &str, duration: f64) -> EditSpec {
    EditSpec::new(video_id, vec![Segment::new(0.0, duration)], "")
}
