use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::Serialize;
use crate::error::{ClipError, ClipResult};

/// Path of the scratch file used while replacing `path`
fn scratch_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    path.with_file_name(format!(".{}.{}.writing", name, uuid::Uuid::new_v4().simple()))
}

/// Write `value` as pretty JSON to `path` atomically.
///
/// The data goes to a scratch file in the same directory, is synced, and
/// is then renamed over `path`, so readers see either the old or the new
/// contents and never a torn file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> ClipResult<()> {
    let persist_err = |source: std::io::Error| ClipError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let scratch = scratch_path(path);
    let result = (|| {
        let mut file = fs::File::create(&scratch)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&scratch, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&scratch);
        return Err(persist_err(e));
    }
    Ok(())
}

/// Whether `path` is a scratch file left behind by an interrupted write
pub fn is_scratch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(".writing"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "old").unwrap();

        let mut map = BTreeMap::new();
        map.insert("a", 1);
        write_json_atomic(&path, &map).unwrap();

        let back: BTreeMap<String, i32> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.get("a"), Some(&1));
    }

    #[test]
    fn test_no_scratch_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_scratch_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_scratch_file_detection() {
        assert!(is_scratch_file(Path::new("/s/.history.json.abc.writing")));
        assert!(!is_scratch_file(Path::new("/s/history.json")));
    }
}
