use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use sitevault_core::{
    ArchiveKind, BackupOutcome, Component, OpError, ProjectConfig, SkipReason,
};
use sitevault_remote::{Connector, DatabaseAdapter};
use sitevault_storage::{archive_key, project_prefix, prune, BlobStore, ProjectRegistry};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{self, ArchiveContents, BuildSource, DumpStatus};
use crate::gate::BackupGate;

/// Deployment policy handed to the coordinators at construction.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Global blob-store key prefix; projects live under `{prefix}/{name}/`.
    pub prefix: String,
    pub max_archives: usize,
    /// Parent of per-job temp dirs; the system temp dir when unset.
    pub temp_root: Option<PathBuf>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            prefix: "backups".into(),
            max_archives: 11,
            temp_root: None,
        }
    }
}

/// Result of one un-gated archive-and-upload run.
#[derive(Debug)]
pub(crate) struct JobResult {
    pub archive_key: String,
    pub dump: DumpStatus,
}

/// Runs backups: single-flight per project, build, upload, prune.
pub struct BackupCoordinator {
    store: Arc<dyn BlobStore>,
    registry: Arc<ProjectRegistry>,
    connector: Arc<dyn Connector>,
    database: Arc<dyn DatabaseAdapter>,
    gate: BackupGate,
    settings: JobSettings,
}

impl BackupCoordinator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        registry: Arc<ProjectRegistry>,
        connector: Arc<dyn Connector>,
        database: Arc<dyn DatabaseAdapter>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            registry,
            connector,
            database,
            gate: BackupGate::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn database(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.database
    }

    pub fn gate(&self) -> &BackupGate {
        &self.gate
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub(crate) fn load_project(&self, name: &str) -> Result<ProjectConfig, OpError> {
        self.registry
            .get(name)
            .map_err(|e| OpError::upstream("read project registry", &e))?
            .ok_or_else(|| OpError::NotFound(format!("project {name} is not registered")))
    }

    /// Back up `project` now, unless a backup or restore of it is running.
    pub async fn run_backup(&self, project: &str) -> BackupOutcome {
        let config = match self.load_project(project) {
            Ok(config) => config,
            Err(error) => {
                error!(project, error = %error, "backup rejected");
                return BackupOutcome::Failed { error };
            }
        };

        info!(project, phase = "acquiring-lock", "backup requested");
        let Some(_guard) = self.gate.try_acquire(project) else {
            info!(project, "backup skipped: another operation holds the project");
            return BackupOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            };
        };

        let job = match self
            .run_job(&config, ArchiveKind::Scheduled, ArchiveContents::FULL, now())
            .await
        {
            Ok(job) => job,
            Err(error) => {
                error!(project, error = %error, "backup failed");
                return BackupOutcome::Failed { error };
            }
        };

        info!(project, phase = "pruning", max_archives = self.settings.max_archives, "applying retention");
        let prefix = project_prefix(&self.settings.prefix, project);
        match prune(self.store.as_ref(), &prefix, self.settings.max_archives).await {
            Ok(report) if !report.failed.is_empty() => {
                warn!(project, failed = report.failed.len(), remaining = report.remaining, "retention left archives behind");
            }
            Ok(report) => {
                info!(project, deleted = report.deleted.len(), remaining = report.remaining, "retention applied");
            }
            Err(e) => warn!(project, error = %e, "retention listing failed"),
        }

        info!(project, phase = "done", archive_key = %job.archive_key, "backup finished");
        match job.dump {
            DumpStatus::Failed(reason) => {
                warn!(project, archive_key = %job.archive_key, "backup is missing its database dump");
                BackupOutcome::Partial {
                    archive_key: job.archive_key,
                    missing: Component::Database,
                    reason,
                }
            }
            DumpStatus::Included(_) | DumpStatus::NotRequested => BackupOutcome::Success {
                archive_key: job.archive_key,
            },
        }
    }

    /// Build and upload one archive. The caller holds the project gate.
    ///
    /// The job's temp dir is removed on every path; a failed removal is
    /// logged and never replaces the job's own result.
    pub(crate) async fn run_job(
        &self,
        config: &ProjectConfig,
        kind: ArchiveKind,
        contents: ArchiveContents,
        at: NaiveDateTime,
    ) -> Result<JobResult, OpError> {
        let project = config.name.as_str();
        let job_id = Uuid::new_v4();
        let work = self.temp_dir()?;

        let result: Result<JobResult, OpError> = async {
            let file_name = kind.file_name(project, at);
            let key = archive_key(&self.settings.prefix, project, &file_name);
            let exec = self.connector.connect(&config.source);

            info!(project, %job_id, phase = "building", host = %exec.host(), "building archive");
            let built = archive::build(
                BuildSource {
                    exec: exec.as_ref(),
                    database: self.database.as_ref(),
                    source_path: config.source.path(),
                    creds: &config.database,
                },
                contents,
                at,
                work.path(),
                &work.path().join(&file_name),
            )
            .await
            .map_err(|e| OpError::upstream("build archive", &e))?;

            info!(project, %job_id, phase = "uploading", archive_key = %key, files = built.file_entries, "uploading archive");
            self.store
                .put_file(&key, &built.path)
                .await
                .map_err(|e| OpError::upstream("upload archive", &anyhow::Error::from(e)))?;

            Ok(JobResult {
                archive_key: key,
                dump: built.dump,
            })
        }
        .await;

        let path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            warn!(project, %job_id, path = %path.display(), error = %e, "failed to remove job temp dir");
        }
        result
    }

    pub(crate) fn temp_dir(&self) -> Result<tempfile::TempDir, OpError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sitevault-");
        let dir = match &self.settings.temp_root {
            Some(root) => std::fs::create_dir_all(root).and_then(|()| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        dir.map_err(|e| OpError::upstream("create temp dir", &anyhow::Error::from(e)))
    }
}

/// Local wall-clock time, which archive names are stamped with.
pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
