use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OpError;

/// Part of a backup that can go missing without failing the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Success {
        archive_key: String,
    },
    /// Uploaded, but without the database dump.
    Partial {
        archive_key: String,
        missing: Component,
        reason: String,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: OpError,
    },
}

impl BackupOutcome {
    pub fn archive_key(&self) -> Option<&str> {
        match self {
            BackupOutcome::Success { archive_key } | BackupOutcome::Partial { archive_key, .. } => {
                Some(archive_key)
            }
            BackupOutcome::Skipped { .. } | BackupOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreScope {
    Code,
    #[serde(alias = "db")]
    Database,
    #[serde(alias = "full")]
    Both,
}

impl RestoreScope {
    pub fn includes_code(self) -> bool {
        matches!(self, RestoreScope::Code | RestoreScope::Both)
    }

    pub fn includes_database(self) -> bool {
        matches!(self, RestoreScope::Database | RestoreScope::Both)
    }
}

impl FromStr for RestoreScope {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(RestoreScope::Code),
            "database" | "db" => Ok(RestoreScope::Database),
            "both" | "full" => Ok(RestoreScope::Both),
            other => Err(OpError::Validation(format!(
                "unknown restore scope {other:?}, expected code, database or both"
            ))),
        }
    }
}

impl fmt::Display for RestoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreScope::Code => "code",
            RestoreScope::Database => "database",
            RestoreScope::Both => "both",
        })
    }
}

/// State of the safety net taken right before a restore clears anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SafetyBackup {
    Taken { archive_key: String },
    /// Uploaded, but the database dump is missing from it.
    Degraded { archive_key: String, reason: String },
    Failed { reason: String },
}

impl SafetyBackup {
    /// Operator-facing warning when the restore ran without a full safety net.
    pub fn warning(&self) -> Option<String> {
        match self {
            SafetyBackup::Taken { .. } => None,
            SafetyBackup::Degraded { archive_key, reason } => Some(format!(
                "safety backup {archive_key} has no database dump: {reason}"
            )),
            SafetyBackup::Failed { reason } => {
                Some(format!("restore proceeded without a safety backup: {reason}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored {
        archive_key: String,
        scope: RestoreScope,
        safety_backup: SafetyBackup,
    },
    Failed {
        error: OpError,
        /// `None` when the restore was rejected before the safety step.
        safety_backup: Option<SafetyBackup>,
    },
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, RestoreOutcome::Restored { .. })
    }

    pub fn safety_backup(&self) -> Option<&SafetyBackup> {
        match self {
            RestoreOutcome::Restored { safety_backup, .. } => Some(safety_backup),
            RestoreOutcome::Failed { safety_backup, .. } => safety_backup.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_accepts_legacy_spellings() {
        assert_eq!("full".parse::<RestoreScope>().unwrap(), RestoreScope::Both);
        assert_eq!("db".parse::<RestoreScope>().unwrap(), RestoreScope::Database);
        assert!("everything".parse::<RestoreScope>().is_err());
        assert!(RestoreScope::Both.includes_code() && RestoreScope::Both.includes_database());
        assert!(!RestoreScope::Code.includes_database());
    }

    #[test]
    fn backup_outcome_serializes_with_status_tag() {
        let partial = BackupOutcome::Partial {
            archive_key: "backups/blog/blog-backup-20260101-000000.zip".into(),
            missing: Component::Database,
            reason: "mysqldump exited with 2".into(),
        };
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["missing"], "database");
        assert!(!partial.is_success());
        assert!(partial.archive_key().is_some());

        let skipped = serde_json::to_value(BackupOutcome::Skipped {
            reason: SkipReason::AlreadyRunning,
        })
        .unwrap();
        assert_eq!(skipped["reason"], "already_running");
    }

    #[test]
    fn failed_safety_backup_is_a_warning() {
        let sb = SafetyBackup::Failed { reason: "upload refused".into() };
        assert!(sb.warning().unwrap().contains("without a safety backup"));
        assert!(SafetyBackup::Taken { archive_key: "k".into() }.warning().is_none());
    }
}
