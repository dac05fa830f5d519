use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::edit::EditSpec;
use crate::error::{ClipError, ClipResult};
use crate::persist::write_json_atomic;

/// Per-video playback position and last edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub video_id: String,
    #[serde(default)]
    pub last_position_sec: f64,
    #[serde(default)]
    pub edit_spec: Option<EditSpec>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(video_id: impl Into<String>) -> Self {
        HistoryRecord {
            video_id: video_id.into(),
            last_position_sec: 0.0,
            edit_spec: None,
            updated_at: Utc::now(),
        }
    }
}

/// History kept as one JSON array, newest record first
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    records: Mutex<Vec<HistoryRecord>>,
}

impl HistoryStore {
    /// Open the history file at `path`, keeping at most `limit` records.
    ///
    /// A missing file is an empty history; so is a corrupt one, which is
    /// logged and overwritten on the next write.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> Self {
        let path = path.into();
        let records = load_records(&path);
        debug!("History loaded: {} record(s) from {}", records.len(), path.display());
        HistoryStore {
            path,
            limit: limit.max(1),
            records: Mutex::new(records),
        }
    }

    /// Replace the record for `video_id` and move it to the front
    pub fn upsert(&self, video_id: &str, mut record: HistoryRecord) -> ClipResult<HistoryRecord> {
        record.video_id = video_id.to_string();
        record.updated_at = Utc::now();
        self.update(|records| {
            records.retain(|r| r.video_id != video_id);
            records.insert(0, record.clone());
        })?;
        Ok(record)
    }

    /// Record for `video_id`, or an empty one if it has none
    pub fn get(&self, video_id: &str) -> HistoryRecord {
        self.records
            .lock()
            .iter()
            .find(|r| r.video_id == video_id)
            .cloned()
            .unwrap_or_else(|| HistoryRecord::new(video_id))
    }

    pub fn load_all(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    /// Newest first, at most `n`
    pub fn recent(&self, n: usize) -> Vec<HistoryRecord> {
        self.records.lock().iter().take(n).cloned().collect()
    }

    pub fn record_position(&self, video_id: &str, position_sec: f64) -> ClipResult<HistoryRecord> {
        if !position_sec.is_finite() || position_sec < 0.0 {
            return Err(ClipError::validation(format!(
                "playback position must be a non-negative number, got {}",
                position_sec
            )));
        }
        let mut record = self.get(video_id);
        record.last_position_sec = position_sec;
        self.upsert(video_id, record)
    }

    pub fn record_edit(&self, video_id: &str, spec: &EditSpec) -> ClipResult<HistoryRecord> {
        let mut record = self.get(video_id);
        record.edit_spec = Some(spec.clone());
        self.upsert(video_id, record)
    }

    /// Forget `video_id`; returns whether a record existed
    pub fn remove(&self, video_id: &str) -> ClipResult<bool> {
        let mut existed = false;
        self.update(|records| {
            let before = records.len();
            records.retain(|r| r.video_id != video_id);
            existed = records.len() != before;
        })?;
        Ok(existed)
    }

    /// Apply `f` and write the result; memory is left untouched if the write fails
    fn update<F>(&self, f: F) -> ClipResult<()>
    where
        F: FnOnce(&mut Vec<HistoryRecord>),
    {
        let mut records = self.records.lock();
        let mut next = records.clone();
        f(&mut next);
        next.truncate(self.limit);
        write_json_atomic(&self.path, &next)?;
        *records = next;
        Ok(())
    }
}

fn load_records(path: &Path) -> Vec<HistoryRecord> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Failed to read history file {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<HistoryRecord>>(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!("History file {} is corrupt, starting empty: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::Segment;

    fn store(dir: &Path, limit: usize) -> HistoryStore {
        HistoryStore::open(dir.join("history.json"), limit)
    }

    #[test]
    fn test_unknown_video_gets_default_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = store(dir.path(), 50).get("a.mp4");
        assert_eq!(record.video_id, "a.mp4");
        assert_eq!(record.last_position_sec, 0.0);
        assert!(record.edit_spec.is_none());
    }

    #[test]
    fn test_position_and_edit_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let spec = EditSpec::new("a.mp4", vec![Segment::new(1.0, 2.0)], "");
        {
            let s = store(dir.path(), 50);
            s.record_position("a.mp4", 42.5).unwrap();
            s.record_edit("a.mp4", &spec).unwrap();
        }
        let record = store(dir.path(), 50).get("a.mp4");
        assert_eq!(record.last_position_sec, 42.5);
        assert_eq!(record.edit_spec, Some(spec));
    }

    #[test]
    fn test_recent_is_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 3);
        for name in ["a", "b", "c", "d"] {
            s.record_position(name, 1.0).unwrap();
        }
        s.record_position("b", 2.0).unwrap();

        let ids: Vec<String> = s.recent(10).into_iter().map(|r| r.video_id).collect();
        assert_eq!(ids, vec!["b", "d", "c"]);
        assert_eq!(store(dir.path(), 3).load_all().len(), 3);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50);
        s.record_position("a", 1.0).unwrap();
        assert!(s.remove("a").unwrap());
        assert!(!s.remove("a").unwrap());
        assert!(s.load_all().is_empty());
    }

    #[test]
    fn test_rejects_bad_position() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50);
        assert!(matches!(s.record_position("a", -1.0), Err(ClipError::Validation(_))));
        assert!(matches!(s.record_position("a", f64::NAN), Err(ClipError::Validation(_))));
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("history.json"), "[{oops").unwrap();
        let s = store(dir.path(), 50);
        assert!(s.load_all().is_empty());
        s.record_position("a", 3.0).unwrap();
        assert_eq!(store(dir.path(), 50).get("a").last_position_sec, 3.0);
    }
}
