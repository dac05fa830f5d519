use serde::{Deserialize, Serialize};
use crate::error::{ClipError, ClipResult};

/// Smallest segment length the encoder can produce a frame for
const MIN_SEGMENT_SECS: f64 = 0.001;

/// A kept time range of the source, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Self {
        Segment { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A user-submitted edit: the segments of `video_id` to keep, in output order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSpec {
    pub video_id: String,
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub output_name: String,
}

impl EditSpec {
    pub fn new(video_id: impl Into<String>, segments: Vec<Segment>, output_name: impl Into<String>) -> Self {
        EditSpec {
            video_id: video_id.into(),
            segments,
            output_name: output_name.into(),
        }
    }

    /// Build an edit from regions to cut out of the video.
    ///
    /// The kept segments are the gaps between the removed regions within
    /// `[0, duration]`. Removed regions may be given in any order and may
    /// overlap each other.
    pub fn from_removed_regions(
        video_id: impl Into<String>,
        removed: &[Segment],
        duration: f64,
        output_name: impl Into<String>,
    ) -> ClipResult<Self> {
        for r in removed {
            check_bounds(r, duration)?;
        }

        let mut sorted: Vec<Segment> = removed.to_vec();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut keep = Vec::new();
        let mut last_end = 0.0_f64;
        for r in &sorted {
            if r.start - last_end >= MIN_SEGMENT_SECS {
                keep.push(Segment::new(last_end, r.start));
            }
            last_end = last_end.max(r.end);
        }
        if duration - last_end >= MIN_SEGMENT_SECS {
            keep.push(Segment::new(last_end, duration));
        }

        if keep.is_empty() {
            return Err(ClipError::validation(
                "every part of the video would be removed; keep at least one region",
            ));
        }

        Ok(EditSpec::new(video_id, keep, output_name))
    }

    /// Check the segment list against the source duration.
    ///
    /// Segments must be non-empty, finite, within `[0, duration]` and must
    /// not overlap each other (touching end-to-start is allowed).
    pub fn validate(&self, duration: f64) -> ClipResult<()> {
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ClipError::validation(format!(
                "video {} has no usable duration",
                self.video_id
            )));
        }
        if self.segments.is_empty() {
            return Err(ClipError::validation("no segments selected"));
        }
        for seg in &self.segments {
            check_bounds(seg, duration)?;
        }

        let mut sorted: Vec<&Segment> = self.segments.iter().collect();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));
        for pair in sorted.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(ClipError::validation(format!(
                    "segments ({}, {}) and ({}, {}) overlap",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                )));
            }
        }

        validate_output_name(&self.output_name)
    }

    /// Total length of the edited output in seconds
    pub fn output_duration(&self) -> f64 {
        self.segments.iter().map(Segment::duration).sum()
    }

    /// File name of the edited output.
    ///
    /// Empty names fall back to `<video stem>_edited.mp4`; `.mp4` is appended
    /// when the name carries no extension.
    pub fn output_file_name(&self) -> String {
        let name = self.output_name.trim();
        if name.is_empty() {
            let stem = std::path::Path::new(&self.video_id)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("video");
            return format!("{}_edited.mp4", stem);
        }
        if std::path::Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{}.mp4", name)
        }
    }
}

fn check_bounds(seg: &Segment, duration: f64) -> ClipResult<()> {
    if !seg.start.is_finite() || !seg.end.is_finite() {
        return Err(ClipError::validation("segment bounds must be finite numbers"));
    }
    if seg.start < 0.0 {
        return Err(ClipError::validation(format!(
            "segment start {} is negative",
            seg.start
        )));
    }
    if seg.start >= seg.end {
        return Err(ClipError::validation(format!(
            "segment start {} is not before its end {}",
            seg.start, seg.end
        )));
    }
    if seg.end > duration {
        return Err(ClipError::validation(format!(
            "segment end {} is past the video duration {}",
            seg.end, duration
        )));
    }
    Ok(())
}

fn validate_output_name(name: &str) -> ClipResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(());
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." || name.starts_with('.') {
        return Err(ClipError::validation(format!(
            "output name must be a plain file name: {}",
            name
        )));
    }
    if name.contains(".tmp.") {
        return Err(ClipError::validation("output name may not contain \".tmp.\""));
    }
    Ok(())
}
