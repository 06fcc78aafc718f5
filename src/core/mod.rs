pub mod backup_engine;
pub mod credentials;
pub mod cron;
pub mod filters;
pub mod inventory;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod wake;

pub use backup_engine::{BackupEngine, BackupOutcome, BackupRequest, BackupResult, EngineEvent};
pub use cron::{CronExpr, normalize_cron};
pub use inventory::{Inventory, StaticInventory};
pub use models::{BackupJob, Device, JobStatus, JobTarget, JobType, ProtocolType, Schedule, Share};
pub use orchestrator::Orchestrator;
pub use protocol::{PluginRegistry, ProtocolPlugin};
pub use registry::{JobFilter, JobRegistry};
pub use scheduler::{Scheduler, Trigger, TriggerKey};
