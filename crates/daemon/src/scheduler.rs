//! Cache maintenance: prunes old jobs and deletes cache files nothing refers to.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogEntry};
use crate::compat::{compat_path, is_fresh};
use crate::config::VidclipConfig;
use crate::job::{Job, JobKind, JobState};
use crate::registry::JobRegistry;
use crate::runner::{is_temp_output, temp_output_path};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pruned_jobs: usize,
    pub scanned: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    pub failures: usize,
    /// Thumbnails and playback copies were left alone because the catalog
    /// could not be listed
    pub catalog_skipped: bool,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pruned {} job(s), scanned {} file(s), deleted {} ({} freed), {} failure(s)",
            self.pruned_jobs,
            self.scanned,
            self.deleted,
            format_size(self.bytes_freed, DECIMAL),
            self.failures
        )?;
        if self.catalog_skipped {
            write!(f, ", thumbnails and playback copies skipped")?;
        }
        Ok(())
    }
}

/// Files and directories a sweep must keep
#[derive(Debug, Default)]
struct Referenced {
    /// Outputs of retained Succeeded jobs
    outputs: HashSet<PathBuf>,
    /// Job ids whose whole directory is off limits
    active_jobs: HashSet<String>,
    /// `None` when the catalog could not be listed
    thumbnails: Option<HashSet<PathBuf>>,
    /// Up to date playback copies of listed videos; `None` with `thumbnails`
    playback_copies: Option<HashSet<PathBuf>>,
}

impl Referenced {
    fn from_jobs(jobs: &[Job]) -> Self {
        let mut referenced = Referenced::default();
        for job in jobs {
            match job.state {
                JobState::Queued | JobState::Running => {
                    referenced.active_jobs.insert(job.job_id.clone());
                }
                JobState::Succeeded => {
                    if let Some(path) = &job.output_path {
                        referenced.outputs.insert(path.clone());
                    }
                }
                JobState::Failed | JobState::Cancelled => {}
            }
        }
        referenced
    }
}

pub struct MaintenanceScheduler {
    registry: Arc<JobRegistry>,
    catalog: Arc<Catalog>,
    edits_dir: PathBuf,
    compat_dir: PathBuf,
    retention: Duration,
    interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        catalog: Arc<Catalog>,
        edits_dir: PathBuf,
        compat_dir: PathBuf,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        MaintenanceScheduler {
            registry,
            catalog,
            edits_dir,
            compat_dir,
            retention,
            interval,
        }
    }

    pub fn from_config(cfg: &VidclipConfig, registry: Arc<JobRegistry>, catalog: Arc<Catalog>) -> Self {
        Self::new(
            registry,
            catalog,
            cfg.edits_dir(),
            cfg.compat_dir(),
            cfg.job_retention(),
            cfg.sweep_interval(),
        )
    }

    /// Run one sweep.
    ///
    /// The registry is snapshotted before the catalog is listed and before
    /// any directory is walked. Files of jobs that appear after the snapshot
    /// are caught by a second registry lookup right before deletion.
    pub async fn tick(&self) -> SweepReport {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let pruned = self.registry.prune(Utc::now() - retention);
        for job in &pruned {
            debug!("Pruned job {} ({})", job.job_id, job.state);
        }

        let mut referenced = Referenced::from_jobs(&self.registry.snapshot());

        let catalog = Arc::clone(&self.catalog);
        let listing = tokio::task::spawn_blocking(move || catalog.try_list()).await;
        match listing {
            Ok(Ok(entries)) => {
                referenced.thumbnails = Some(
                    entries
                        .iter()
                        .map(|e| self.catalog.thumbnail_path(&e.id))
                        .collect(),
                );
                referenced.playback_copies = Some(fresh_playback_copies(&self.compat_dir, &entries));
            }
            Ok(Err(e)) => warn!("Catalog listing failed, leaving thumbnails and playback copies alone: {}", e),
            Err(e) => warn!("Catalog listing task failed, leaving thumbnails and playback copies alone: {}", e),
        }

        let registry = Arc::clone(&self.registry);
        let dirs = CacheDirs {
            edits: self.edits_dir.clone(),
            thumbnails: self.catalog.thumbnail_dir().to_path_buf(),
            compat: self.compat_dir.clone(),
        };
        let swept = tokio::task::spawn_blocking(move || sweep(&registry, &dirs, &referenced)).await;

        let mut report = match swept {
            Ok(report) => report,
            Err(e) => {
                warn!("Cache sweep task failed: {}", e);
                SweepReport {
                    failures: 1,
                    ..Default::default()
                }
            }
        };
        report.pruned_jobs = pruned.len();
        report
    }

    /// Sweep every interval until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Cache maintenance every {}s", self.interval.as_secs());

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.deleted > 0 || report.pruned_jobs > 0 || report.failures > 0 {
                        info!("🧹 Cache sweep: {}", report);
                    } else {
                        debug!("Cache sweep: {}", report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Cache maintenance stopped");
    }
}

/// Whether a file under `edits_dir` belongs to a job that must keep it
fn edit_file_is_kept(path: &Path, edits_dir: &Path, referenced: &Referenced, registry: &JobRegistry) -> bool {
    if referenced.outputs.contains(path) {
        return true;
    }
    let Some(job_id) = path
        .strip_prefix(edits_dir)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| c.as_os_str().to_str())
    else {
        return false;
    };
    if referenced.active_jobs.contains(job_id) {
        return true;
    }
    // jobs created or finished after the snapshot
    match registry.get(job_id) {
        Ok(job) if job.state.is_active() => true,
        Ok(job) if job.state == JobState::Succeeded => job.output_path.as_deref() == Some(path),
        _ => false,
    }
}

fn delete_file(path: &Path, report: &mut SweepReport) {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("🗑️  Deleted unreferenced cache file: {}", path.display());
            report.deleted += 1;
            report.bytes_freed += size;
        }
        Err(e) => {
            warn!("Failed to delete cache file {}: {}", path.display(), e);
            report.failures += 1;
        }
    }
}

/// Playback copies of `entries` that are at least as new as their source
fn fresh_playback_copies(compat_dir: &Path, entries: &[CatalogEntry]) -> HashSet<PathBuf> {
    entries
        .iter()
        .filter_map(|e| {
            let copy = compat_path(compat_dir, &e.id).ok()?;
            is_fresh(&e.path, &copy).then_some(copy)
        })
        .collect()
}

/// Whether a file under the compat dir is a live job's output or temp output
fn playback_file_is_in_use(path: &Path, registry: &JobRegistry) -> bool {
    registry
        .list_active()
        .iter()
        .filter(|job| job.kind == JobKind::Compat)
        .filter_map(|job| job.output_path.as_deref())
        .any(|output| {
            if is_temp_output(path) {
                temp_output_path(output) == path
            } else {
                output == path
            }
        })
}

struct CacheDirs {
    edits: PathBuf,
    thumbnails: PathBuf,
    compat: PathBuf,
}

/// Walk every file under `dir`, deleting those `keep` rejects
fn sweep_dir(dir: &Path, report: &mut SweepReport, mut keep: impl FnMut(&Path) -> bool) {
    if !dir.exists() {
        return;
    }
    for entry in WalkDir::new(dir).follow_links(false).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading cache entry: {}", e);
                report.failures += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        report.scanned += 1;
        if !keep(entry.path()) {
            delete_file(entry.path(), report);
        }
    }
}

fn sweep(registry: &JobRegistry, dirs: &CacheDirs, referenced: &Referenced) -> SweepReport {
    let mut report = SweepReport::default();

    sweep_dir(&dirs.edits, &mut report, |path| {
        edit_file_is_kept(path, &dirs.edits, referenced, registry)
    });
    if dirs.edits.exists() {
        remove_empty_job_dirs(&dirs.edits, referenced, registry);
    }

    match (&referenced.thumbnails, &referenced.playback_copies) {
        (Some(thumbnails), Some(copies)) => {
            sweep_dir(&dirs.thumbnails, &mut report, |path| thumbnails.contains(path));
            sweep_dir(&dirs.compat, &mut report, |path| {
                copies.contains(path) || playback_file_is_in_use(path, registry)
            });
        }
        _ => report.catalog_skipped = true,
    }

    report
}

/// Remove now-empty directories under `edits_dir`, deepest first.
///
/// Directories of active jobs are kept, including jobs created after the
/// snapshot whose output directory already exists.
fn remove_empty_job_dirs(edits_dir: &Path, referenced: &Referenced, registry: &JobRegistry) {
    for entry in WalkDir::new(edits_dir)
        .min_depth(1)
        .contents_first(true)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let job_id = entry
            .path()
            .strip_prefix(edits_dir)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str());
        let is_active = job_id
            .map(|id| {
                referenced.active_jobs.contains(id)
                    || registry.get(id).map(|job| job.state.is_active()).unwrap_or(false)
            })
            .unwrap_or(false);
        if is_active {
            continue;
        }
        // fails harmlessly when the directory is not empty
        if std::fs::remove_dir(entry.path()).is_ok() {
            debug!("Removed empty edit directory: {}", entry.path().display());
        }
    }
}
