pub mod config;
pub mod error;
pub mod edit;
pub mod catalog;
pub mod probe;
pub mod progress;
pub mod persist;
pub mod job;
pub mod registry;
pub mod runner;
pub mod compat;
pub mod history;
pub mod orchestrator;
pub mod scheduler;
pub mod commands;

pub use config::{CompatSettings, EncoderSettings, VidclipConfig, VideoRoot};
pub use error::{ClipError, ClipResult};
pub use edit::{EditSpec, Segment};
pub use catalog::{Catalog, CatalogEntry, FolderSummary, VideoRef};
pub use probe::{DurationProbe, FfprobeDuration};
pub use job::{Job, JobId, JobKind, JobState, JobStatus};
pub use registry::{JobRegistry, RecoveryReport};
pub use runner::{ProcessRunner, RunnerSettings};
pub use compat::CompatStatus;
pub use history::{HistoryRecord, HistoryStore};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use scheduler::{MaintenanceScheduler, SweepReport};
pub use commands::CommandFile;
