pub mod archive;
pub mod backup;
pub mod config;
pub mod gate;
pub mod restore;
pub mod scheduler;
pub mod server;
pub mod vault;

pub use backup::{BackupCoordinator, JobSettings};
pub use gate::{BackupGate, GateGuard};
pub use restore::RestoreCoordinator;
pub use scheduler::{Scheduler, TriggerHandler};
pub use server::{build_router, AppState};
pub use vault::{ProjectSummary, RemovedProject, Vault};
