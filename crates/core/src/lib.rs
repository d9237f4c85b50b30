pub mod archive;
pub mod error;
pub mod outcome;
pub mod project;

pub use archive::{is_archive_key, ArchiveKind, ArchiveRecord, ARCHIVE_EXTENSION};
pub use error::{ErrorKind, OpError};
pub use outcome::{BackupOutcome, Component, RestoreOutcome, RestoreScope, SafetyBackup, SkipReason};
pub use project::{DbCredentials, DbEngine, ProjectConfig, SourceLocation, TimeOfDay};
