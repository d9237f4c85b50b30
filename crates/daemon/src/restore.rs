use std::path::Path;
use std::sync::Arc;

use sitevault_core::{
    is_archive_key, ArchiveKind, OpError, ProjectConfig, RestoreOutcome, RestoreScope, SafetyBackup,
};
use sitevault_storage::{project_prefix, BlobError};
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveContents, DumpStatus, Extracted};
use crate::backup::{now, BackupCoordinator};

/// Restores archives: safety backup, download, extract, clear, apply.
#[derive(Clone)]
pub struct RestoreCoordinator {
    backups: Arc<BackupCoordinator>,
}

impl RestoreCoordinator {
    pub fn new(backups: Arc<BackupCoordinator>) -> Self {
        Self { backups }
    }

    /// Restore `scope` of `project` from the archive stored at `archive_key`.
    ///
    /// Nothing on the project's host is touched until the archive has been
    /// downloaded and unpacked. Later failures leave the host as they found
    /// it mid-way; the safety backup is the way back.
    pub async fn run_restore(&self, project: &str, archive_key: &str, scope: RestoreScope) -> RestoreOutcome {
        let config = match self.check_request(project, archive_key) {
            Ok(config) => config,
            Err(error) => {
                error!(project, archive_key, error = %error, "restore rejected");
                return RestoreOutcome::Failed {
                    error,
                    safety_backup: None,
                };
            }
        };

        let Some(_guard) = self.backups.gate().try_acquire(project) else {
            let error = OpError::LockContention(project.to_owned());
            warn!(project, archive_key, "restore refused: another operation holds the project");
            return RestoreOutcome::Failed {
                error,
                safety_backup: None,
            };
        };

        info!(project, archive_key, %scope, phase = "safety-backup", "restore started");
        let safety_backup = self.safety_backup(&config, scope).await;
        if let Some(warning) = safety_backup.warning() {
            warn!(project, archive_key, "{warning}");
        }

        match self.apply(&config, archive_key, scope).await {
            Ok(()) => {
                info!(project, archive_key, %scope, phase = "done", "restore finished");
                RestoreOutcome::Restored {
                    archive_key: archive_key.to_owned(),
                    scope,
                    safety_backup,
                }
            }
            Err(error) => {
                error!(project, archive_key, %scope, error = %error, "restore failed");
                RestoreOutcome::Failed {
                    error,
                    safety_backup: Some(safety_backup),
                }
            }
        }
    }

    fn check_request(&self, project: &str, archive_key: &str) -> Result<ProjectConfig, OpError> {
        let config = self.backups.load_project(project)?;
        let prefix = project_prefix(&self.backups.settings().prefix, project);
        let inside = archive_key
            .strip_prefix(&prefix)
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
        if !inside || !is_archive_key(archive_key) {
            return Err(OpError::Validation(format!(
                "archive {archive_key} is not an archive of project {project}"
            )));
        }
        Ok(config)
    }

    /// Best effort: a failure here is recorded on the outcome, never fatal.
    async fn safety_backup(&self, config: &ProjectConfig, scope: RestoreScope) -> SafetyBackup {
        let contents = ArchiveContents::for_scope(scope);
        match self
            .backups
            .run_job(config, ArchiveKind::PreRestore, contents, now())
            .await
        {
            Ok(job) => match job.dump {
                DumpStatus::Failed(reason) => SafetyBackup::Degraded {
                    archive_key: job.archive_key,
                    reason,
                },
                DumpStatus::Included(_) | DumpStatus::NotRequested => SafetyBackup::Taken {
                    archive_key: job.archive_key,
                },
            },
            Err(e) => SafetyBackup::Failed { reason: e.to_string() },
        }
    }

    async fn apply(&self, config: &ProjectConfig, archive_key: &str, scope: RestoreScope) -> Result<(), OpError> {
        let work = self.backups.temp_dir()?;
        let result = self.apply_in(config, archive_key, scope, work.path()).await;
        let path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            warn!(project = %config.name, path = %path.display(), error = %e, "failed to remove restore temp dir");
        }
        result
    }

    async fn apply_in(
        &self,
        config: &ProjectConfig,
        archive_key: &str,
        scope: RestoreScope,
        work: &Path,
    ) -> Result<(), OpError> {
        let project = config.name.as_str();
        let downloaded = work.join("archive.zip");

        info!(project, archive_key, phase = "downloading", "fetching archive");
        self.backups
            .store()
            .get_file(archive_key, &downloaded)
            .await
            .map_err(|e| match e {
                BlobError::NotFound(key) => OpError::NotFound(format!("archive {key} does not exist")),
                other => OpError::upstream("download archive", &anyhow::Error::from(other)),
            })?;

        info!(project, archive_key, phase = "extracting", "unpacking archive");
        let engine = config.database.engine;
        let (archive_path, extract_dir) = (downloaded.clone(), work.join("extract"));
        let Extracted { code_dir, dump } = tokio::task::spawn_blocking(move || {
            archive::extract(&archive_path, &extract_dir, engine)
        })
        .await
        .map_err(|e| OpError::upstream("extract archive", &anyhow::Error::from(e)))?
        .map_err(|e| OpError::upstream("extract archive", &e))?;
        if let Err(e) = tokio::fs::remove_file(&downloaded).await {
            warn!(project, path = %downloaded.display(), error = %e, "failed to remove downloaded archive");
        }

        if scope.includes_database() && dump.is_none() {
            return Err(OpError::NotFound(format!(
                "archive {archive_key} holds no database dump"
            )));
        }

        let exec = self.backups.connector().connect(&config.source);
        let database = self.backups.database();
        let target = config.source.path();

        info!(project, archive_key, phase = "clearing", host = %exec.host(), "clearing restore targets");
        if scope.includes_code() {
            exec.clear_tree(target)
                .await
                .map_err(|e| OpError::upstream("clear code tree", &e))?;
        }
        if scope.includes_database() {
            database
                .recreate(exec.as_ref(), &config.database)
                .await
                .map_err(|e| OpError::upstream("recreate database", &e))?;
        }

        info!(project, archive_key, phase = "applying", "restoring archive contents");
        if scope.includes_code() {
            exec.push_tree(&code_dir, target)
                .await
                .map_err(|e| OpError::upstream("restore code tree", &e))?;
        }
        if let (true, Some(dump)) = (scope.includes_database(), dump) {
            let restored = database.restore(exec.as_ref(), &config.database, &dump).await;
            if let Err(e) = tokio::fs::remove_file(&dump).await {
                warn!(project, path = %dump.display(), error = %e, "failed to remove extracted dump");
            }
            restored.map_err(|e| OpError::upstream("restore database", &e))?;
        }
        Ok(())
    }
}
