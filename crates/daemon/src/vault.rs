//! Project lifecycle shared by the HTTP API and the CLI.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use sitevault_core::{
    ArchiveRecord, BackupOutcome, OpError, ProjectConfig, RestoreOutcome, RestoreScope,
};
use sitevault_storage::{discover_projects, listing_prefix, project_prefix};
use tracing::{info, warn};

use crate::backup::BackupCoordinator;
use crate::restore::RestoreCoordinator;
use crate::scheduler::{Scheduler, TriggerFuture, TriggerHandler};

/// What listing shows about a project; never the database password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub name: String,
    /// `false` for projects that only have archives left in the store.
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_backup: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedProject {
    pub name: String,
    pub deleted_archives: usize,
}

#[derive(Clone)]
pub struct Vault {
    backups: Arc<BackupCoordinator>,
    restores: RestoreCoordinator,
    scheduler: Scheduler,
}

impl Vault {
    pub fn new(backups: Arc<BackupCoordinator>, scheduler: Scheduler) -> Self {
        Self {
            restores: RestoreCoordinator::new(Arc::clone(&backups)),
            backups,
            scheduler,
        }
    }

    pub fn backups(&self) -> &Arc<BackupCoordinator> {
        &self.backups
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn handler_for(&self, project: &str) -> TriggerHandler {
        let backups = Arc::clone(&self.backups);
        let project = project.to_owned();
        Arc::new(move || {
            let backups = Arc::clone(&backups);
            let project = project.clone();
            Box::pin(async move {
                backups.run_backup(&project).await;
            }) as TriggerFuture
        })
    }

    /// Installs a trigger for every registered project.
    pub fn reinstall_triggers(&self) -> anyhow::Result<usize> {
        let registry = Arc::clone(self.backups.registry());
        self.scheduler
            .reinstall_all(&registry, |project| self.handler_for(project))
    }

    /// Validates and stores `config`, then (re)installs its daily trigger.
    pub fn register(&self, config: ProjectConfig) -> Result<ProjectSummary, OpError> {
        config.validate()?;
        let previous = self
            .backups
            .registry()
            .upsert(config.clone())
            .map_err(|e| OpError::upstream("write project registry", &e))?;
        info!(project = %config.name, replaced = previous.is_some(), "project registered");
        let next = self.scheduler.install_daily_trigger(
            &config.name,
            config.backup_time,
            self.handler_for(&config.name),
        );
        Ok(ProjectSummary {
            name: config.name,
            registered: true,
            source: Some(config.source.to_string()),
            backup_time: Some(config.backup_time.to_string()),
            next_backup: Some(next),
        })
    }

    /// Takes the project's gate and cancels its trigger before looking at the
    /// store, so no backup can add an archive while objects are deleted. The
    /// registry entry is dropped last and is kept if any deletion fails, so
    /// the removal can be retried.
    pub async fn remove(&self, name: &str) -> Result<RemovedProject, OpError> {
        let config = self
            .backups
            .registry()
            .get(name)
            .map_err(|e| OpError::upstream("read project registry", &e))?;
        let Some(_guard) = self.backups.gate().try_acquire(name) else {
            return Err(OpError::LockContention(name.to_owned()));
        };
        let cancelled = self.scheduler.cancel(name);

        let prefix = project_prefix(&self.backups.settings().prefix, name);
        let store = self.backups.store();
        let objects = match store.list(&prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                if let (true, Some(config)) = (cancelled, &config) {
                    self.scheduler
                        .install_daily_trigger(name, config.backup_time, self.handler_for(name));
                }
                return Err(OpError::upstream("list archives", &anyhow::Error::from(e)));
            }
        };
        if config.is_none() && objects.is_empty() {
            return Err(OpError::NotFound(format!("project {name} does not exist")));
        }

        let mut failed = Vec::new();
        for object in &objects {
            if let Err(e) = store.delete(&object.key).await {
                warn!(project = name, key = %object.key, error = %e, "failed to delete archive");
                failed.push(object.key.clone());
            }
        }
        if !failed.is_empty() {
            return Err(OpError::Upstream(format!(
                "could not delete {} of {} objects of project {name}: {}",
                failed.len(),
                objects.len(),
                failed.join(", ")
            )));
        }
        self.backups
            .registry()
            .remove(name)
            .map_err(|e| OpError::upstream("write project registry", &e))?;
        info!(project = name, deleted = objects.len(), "project removed");
        Ok(RemovedProject {
            name: name.to_owned(),
            deleted_archives: objects.len(),
        })
    }

    /// Registered projects plus any that only exist in the store.
    pub async fn projects(&self) -> Result<Vec<ProjectSummary>, OpError> {
        let registered = self
            .backups
            .registry()
            .load()
            .map_err(|e| OpError::upstream("read project registry", &e))?;
        let global = &self.backups.settings().prefix;
        let stored = self
            .backups
            .store()
            .list(&listing_prefix(global))
            .await
            .map_err(|e| OpError::upstream("list archives", &anyhow::Error::from(e)))?;

        let mut summaries: Vec<ProjectSummary> = registered
            .values()
            .map(|p| ProjectSummary {
                name: p.name.clone(),
                registered: true,
                source: Some(p.source.to_string()),
                backup_time: Some(p.backup_time.to_string()),
                next_backup: self.scheduler.next_fire(&p.name),
            })
            .collect();
        for name in discover_projects(global, &stored) {
            if !registered.contains_key(&name) {
                summaries.push(ProjectSummary {
                    name,
                    registered: false,
                    source: None,
                    backup_time: None,
                    next_backup: None,
                });
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Restorable archives of `name`, newest first.
    pub async fn archives(&self, name: &str) -> Result<Vec<ArchiveRecord>, OpError> {
        let prefix = project_prefix(&self.backups.settings().prefix, name);
        let mut archives: Vec<_> = self
            .backups
            .store()
            .list(&prefix)
            .await
            .map_err(|e| OpError::upstream("list archives", &anyhow::Error::from(e)))?
            .into_iter()
            .filter(ArchiveRecord::is_archive)
            .collect();
        if archives.is_empty() && self.backups.load_project(name).is_err() {
            return Err(OpError::NotFound(format!("project {name} does not exist")));
        }
        archives.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });
        Ok(archives)
    }

    pub async fn backup(&self, name: &str) -> BackupOutcome {
        self.backups.run_backup(name).await
    }

    pub async fn restore(&self, name: &str, archive_key: &str, scope: RestoreScope) -> RestoreOutcome {
        self.restores.run_restore(name, archive_key, scope).await
    }
}
