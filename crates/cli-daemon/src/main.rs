use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vidclip::{
    commands::{process_command_files, write_command},
    job::load_all_jobs,
    Catalog, CommandFile, FfprobeDuration, HistoryStore, JobRegistry, MaintenanceScheduler,
    Orchestrator, OrchestratorSettings, ProcessRunner, RunnerSettings, Segment, VidclipConfig,
};

/// How often the command inbox is checked
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Video clip editing daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// List videos in the catalog, newest first
    Videos {
        /// Only list videos under this root name (repeatable)
        #[arg(long)]
        folder: Vec<String>,
    },

    /// Show video counts per root
    Folders,

    /// Queue an edit that keeps the given segments, in order
    Submit {
        /// Video id (path relative to its root)
        video: String,

        /// Segment to keep, as START:END in seconds (repeatable)
        #[arg(long = "segment", required = true, value_parser = parse_segment)]
        segments: Vec<Segment>,

        /// Output file name
        #[arg(short, long, default_value = "")]
        output: String,
    },

    /// Queue an edit that removes the given regions
    Cut {
        /// Video id (path relative to its root)
        video: String,

        /// Region to remove, as START:END in seconds (repeatable)
        #[arg(long = "remove", required = true, value_parser = parse_segment)]
        removed: Vec<Segment>,

        /// Output file name
        #[arg(short, long, default_value = "")]
        output: String,
    },

    /// Cancel a queued or running job
    Cancel {
        job_id: String,
    },

    /// Record the playback position of a video
    Position {
        video: String,
        seconds: f64,
    },

    /// Make or refresh the playback copy (baseline H.264/AAC mp4) of a video
    Compat {
        video: String,
    },

    /// Delete a video with its playback copy and history
    Delete {
        video: String,
    },

    /// Print job status as JSON
    Status {
        /// Only this job
        job_id: Option<String>,
    },

    /// Print playback and edit history, newest first
    History,
}

/// Parse `START:END` seconds
fn parse_segment(s: &str) -> std::result::Result<Segment, String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got {:?}", s))?;
    let start: f64 = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid start time {:?}", start))?;
    let end: f64 = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid end time {:?}", end))?;
    Ok(Segment::new(start, end))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = VidclipConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(cfg).await,
        Commands::Videos { folder } => {
            let catalog = catalog_for(&cfg);
            let filter = if folder.is_empty() { None } else { Some(folder.as_slice()) };
            for entry in catalog.list(filter) {
                println!(
                    "{}  {:>10}  {:<12} {}",
                    entry.modified.format("%Y-%m-%d %H:%M"),
                    format_size(entry.size_bytes, DECIMAL),
                    entry.folder,
                    entry.id
                );
            }
            Ok(())
        }
        Commands::Folders => {
            for summary in catalog_for(&cfg).folder_summaries() {
                println!("{:<16} {:>6}  {}", summary.name, summary.count, summary.path.display());
            }
            Ok(())
        }
        Commands::Submit { video, segments, output } => drop_command(
            &cfg,
            CommandFile::Submit {
                video_id: video,
                segments,
                output_name: output,
            },
        ),
        Commands::Cut { video, removed, output } => drop_command(
            &cfg,
            CommandFile::Cut {
                video_id: video,
                removed,
                output_name: output,
            },
        ),
        Commands::Cancel { job_id } => drop_command(&cfg, CommandFile::Cancel { job_id }),
        Commands::Position { video, seconds } => drop_command(
            &cfg,
            CommandFile::Position {
                video_id: video,
                position_sec: seconds,
            },
        ),
        Commands::Compat { video } => drop_command(&cfg, CommandFile::Compat { video_id: video }),
        Commands::Delete { video } => drop_command(&cfg, CommandFile::Delete { video_id: video }),
        Commands::Status { job_id } => print_status(&cfg, job_id.as_deref()),
        Commands::History => {
            let history = HistoryStore::open(cfg.history_file(), cfg.history_limit);
            println!("{}", serde_json::to_string_pretty(&history.load_all())?);
            Ok(())
        }
    }
}

fn catalog_for(cfg: &VidclipConfig) -> Catalog {
    Catalog::from_config(cfg, Arc::new(FfprobeDuration::new(&cfg.ffprobe_bin)))
}

fn drop_command(cfg: &VidclipConfig, cmd: CommandFile) -> Result<()> {
    let path = write_command(&cfg.command_dir(), &cmd)
        .with_context(|| format!("Failed to write command to {}", cfg.command_dir().display()))?;
    println!("Queued command: {}", path.display());
    Ok(())
}

fn print_status(cfg: &VidclipConfig, job_id: Option<&str>) -> Result<()> {
    let jobs = load_all_jobs(&cfg.job_state_dir()).context("Failed to load jobs")?;
    let statuses: Vec<_> = jobs
        .iter()
        .filter(|j| job_id.map(|id| j.job_id == id).unwrap_or(true))
        .map(|j| j.status())
        .collect();
    if let Some(id) = job_id {
        match statuses.first() {
            Some(status) => println!("{}", serde_json::to_string_pretty(status)?),
            None => bail!("job {} not found", id),
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    }
    Ok(())
}

async fn run_daemon(cfg: VidclipConfig) -> Result<()> {
    if cfg.video_roots.is_empty() {
        bail!("no video_roots configured");
    }

    info!("vidclip daemon starting");
    info!("Configuration loaded:");
    for root in &cfg.video_roots {
        if root.path.exists() {
            info!("  Video root {}: {}", root.name, root.path.display());
        } else {
            warn!("  Video root {} does not exist: {}", root.name, root.path.display());
        }
    }
    info!("  Cache dir: {}", cfg.cache_dir.display());
    info!("  State dir: {}", cfg.state_dir.display());
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    info!("  Sweep interval: {}s", cfg.sweep_interval_secs);

    for dir in [cfg.edits_dir(), cfg.compat_dir(), cfg.thumbnail_dir(), cfg.command_dir()] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    info!("🔄 Starting recovery checks...");
    let (registry, recovery) = JobRegistry::open(&cfg.job_state_dir())
        .context("Failed to open job registry")?;
    if recovery.interrupted > 0 {
        info!(
            "✅ Startup recovery complete: {} interrupted job(s) failed, {} orphan process(es) killed, {} temp file(s) cleaned",
            recovery.interrupted, recovery.killed, recovery.temp_removed
        );
    } else {
        info!("✅ Startup recovery complete: no interrupted jobs found");
    }

    let registry = Arc::new(registry);
    let catalog = Arc::new(catalog_for(&cfg));
    let history = Arc::new(HistoryStore::open(cfg.history_file(), cfg.history_limit));
    let orchestrator = Orchestrator::start(
        Arc::clone(&registry),
        Arc::clone(&catalog),
        ProcessRunner::new(RunnerSettings::from_config(&cfg)),
        Some(Arc::clone(&history)),
        OrchestratorSettings::from_config(&cfg),
    );
    orchestrator.resume().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = MaintenanceScheduler::from_config(&cfg, Arc::clone(&registry), Arc::clone(&catalog));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let command_dir = cfg.command_dir();
    info!("Watching for commands in {}", command_dir.display());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = tokio::time::sleep(COMMAND_POLL_INTERVAL) => {
                if let Err(e) = process_command_files(&command_dir, &orchestrator, &history).await {
                    error!("Command processing failed: {:#}", e);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    orchestrator.shutdown().await;
    if let Err(e) = scheduler_task.await {
        error!("Cache maintenance task ended abnormally: {}", e);
    }
    info!("vidclip daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment() {
        assert_eq!(parse_segment("10:30.5").unwrap(), Segment::new(10.0, 30.5));
        assert_eq!(parse_segment(" 1 : 2 ").unwrap(), Segment::new(1.0, 2.0));
        assert!(parse_segment("10").is_err());
        assert!(parse_segment("a:2").is_err());
    }

    #[test]
    fn test_args_default_to_run() {
        let args = Args::parse_from(["vidclipd"]);
        assert!(args.command.is_none());

        let args = Args::parse_from([
            "vidclipd", "submit", "trip/day1.mp4", "--segment", "0:5", "--segment", "10:12",
        ]);
        match args.command {
            Some(Commands::Submit { video, segments, output }) => {
                assert_eq!(video, "trip/day1.mp4");
                assert_eq!(segments.len(), 2);
                assert!(output.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = Args::parse_from(["vidclipd", "delete", "trip/day1.mp4"]);
        assert!(matches!(args.command, Some(Commands::Delete { video }) if video == "trip/day1.mp4"));
        let args = Args::parse_from(["vidclipd", "compat", "trip/day1.MOV"]);
        assert!(matches!(args.command, Some(Commands::Compat { video }) if video == "trip/day1.MOV"));
    }
}
