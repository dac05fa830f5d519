//! Command inbox.
//!
//! Other processes (the `vidclipd` subcommands) talk to a running daemon by
//! dropping JSON files into `<state_dir>/commands/`. The daemon processes
//! them in file-name order and deletes each one afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::edit::{EditSpec, Segment};
use crate::compat::CompatStatus;
use crate::error::{ClipError, ClipResult};
use crate::history::HistoryStore;
use crate::orchestrator::Orchestrator;
use crate::persist::{is_scratch_file, write_json_atomic};

/// Command file format, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandFile {
    Submit {
        video_id: String,
        segments: Vec<Segment>,
        #[serde(default)]
        output_name: String,
    },
    Cut {
        video_id: String,
        removed: Vec<Segment>,
        #[serde(default)]
        output_name: String,
    },
    Cancel {
        job_id: String,
    },
    Position {
        video_id: String,
        position_sec: f64,
    },
    /// Make or refresh the playback copy of a video
    Compat {
        video_id: String,
    },
    /// Delete a source video, its playback copy and its history
    Delete {
        video_id: String,
    },
}

/// Drop `cmd` into `command_dir`; returns the file written
pub fn write_command(command_dir: &Path, cmd: &CommandFile) -> ClipResult<PathBuf> {
    let name = format!(
        "{:013}-{}.json",
        Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    );
    let path = command_dir.join(name);
    write_json_atomic(&path, cmd)?;
    Ok(path)
}

/// Rejected requests are warnings; daemon-side failures are errors
fn log_rejection(what: &str, e: &ClipError) {
    if e.is_user_facing() {
        warn!("{} rejected: {}", what, e);
    } else {
        error!("{} failed: {}", what, e);
    }
}

async fn execute(cmd: CommandFile, orchestrator: &Orchestrator, history: &HistoryStore) {
    match cmd {
        CommandFile::Submit {
            video_id,
            segments,
            output_name,
        } => match orchestrator
            .submit_edit(EditSpec::new(video_id.clone(), segments, output_name))
            .await
        {
            Ok(job_id) => info!("Job {}: submitted from command file for {}", job_id, video_id),
            Err(e) => log_rejection(&format!("Submit for {}", video_id), &e),
        },
        CommandFile::Cut {
            video_id,
            removed,
            output_name,
        } => match orchestrator.submit_cut(&video_id, &removed, &output_name).await {
            Ok(job_id) => info!("Job {}: cut submitted from command file for {}", job_id, video_id),
            Err(e) => log_rejection(&format!("Cut for {}", video_id), &e),
        },
        CommandFile::Cancel { job_id } => {
            if let Err(e) = orchestrator.cancel_edit(&job_id) {
                log_rejection(&format!("Cancel of job {}", job_id), &e);
            }
        }
        CommandFile::Position {
            video_id,
            position_sec,
        } => match history.record_position(&video_id, position_sec) {
            Ok(_) => debug!("Recorded position {:.1}s for {}", position_sec, video_id),
            Err(e) => log_rejection(&format!("Position for {}", video_id), &e),
        },
        CommandFile::Compat { video_id } => match orchestrator.request_compat(&video_id).await {
            Ok(CompatStatus::Ready { path }) => info!("Playback copy of {} is ready: {}", video_id, path.display()),
            Ok(CompatStatus::Pending { job_id }) => info!("Job {}: making playback copy of {}", job_id, video_id),
            Err(e) => log_rejection(&format!("Playback copy of {}", video_id), &e),
        },
        CommandFile::Delete { video_id } => {
            if let Err(e) = orchestrator.delete_video(&video_id) {
                log_rejection(&format!("Delete of {}", video_id), &e);
            }
        }
    }
}

/// Process every command file in `command_dir`; returns how many were handled
pub async fn process_command_files(
    command_dir: &Path,
    orchestrator: &Orchestrator,
    history: &HistoryStore,
) -> Result<usize> {
    if !command_dir.exists() {
        fs::create_dir_all(command_dir)
            .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    }

    let entries = match fs::read_dir(command_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| !is_scratch_file(p) && p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut processed_count = 0;
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        match serde_json::from_str::<CommandFile>(&content) {
            Ok(cmd) => {
                execute(cmd, orchestrator, history).await;
                processed_count += 1;
            }
            Err(e) => warn!("Failed to parse command file {}: {}", path.display(), e),
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }

    if processed_count > 0 {
        info!("✅ Processed {} command file(s)", processed_count);
    }
    Ok(processed_count)
}
