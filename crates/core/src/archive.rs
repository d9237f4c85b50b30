use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::DbEngine;

pub const ARCHIVE_EXTENSION: &str = ".zip";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Why an archive was taken; only affects its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Scheduled,
    PreRestore,
}

impl ArchiveKind {
    /// `{project}-backup-{YYYYMMDD-HHMMSS}.zip` or
    /// `{project}-pre-restore-backup-{YYYYMMDD-HHMMSS}.zip`.
    pub fn file_name(self, project: &str, at: NaiveDateTime) -> String {
        let ts = format_timestamp(at);
        match self {
            ArchiveKind::Scheduled => format!("{project}-backup-{ts}{ARCHIVE_EXTENSION}"),
            ArchiveKind::PreRestore => {
                format!("{project}-pre-restore-backup-{ts}{ARCHIVE_EXTENSION}")
            }
        }
    }
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `db_backup_{YYYYMMDD-HHMMSS}.sql` (or `.archive` for MongoDB).
pub fn dump_file_name(engine: DbEngine, at: NaiveDateTime) -> String {
    format!("db_backup_{}{}", format_timestamp(at), engine.dump_extension())
}

/// One stored archive, as reported by the blob store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn is_archive(&self) -> bool {
        is_archive_key(&self.key)
    }
}

/// Whether `key` names a restorable archive; the extension is matched
/// case-insensitively.
pub fn is_archive_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with(ARCHIVE_EXTENSION)
}

/// Oldest first; equal timestamps fall back to the key, which embeds the
/// creation time.
pub fn sort_oldest_first(records: &mut [ArchiveRecord]) {
    records.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });
}
