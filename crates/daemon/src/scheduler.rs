//! Daily per-project triggers driven by one polling loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use sitevault_core::TimeOfDay;
use sitevault_storage::ProjectRegistry;
use tracing::{debug, info};

pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Called each time a project's trigger fires.
pub type TriggerHandler = Arc<dyn Fn() -> TriggerFuture + Send + Sync>;

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

struct Trigger {
    at: TimeOfDay,
    next_fire: NaiveDateTime,
    handler: TriggerHandler,
}

/// At most one trigger per project, all behind one lock.
#[derive(Clone)]
pub struct Scheduler {
    triggers: Arc<Mutex<BTreeMap<String, Trigger>>>,
    clock: Clock,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Local::now().naive_local()))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            triggers: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the daily trigger for `project`, replacing any existing one
    /// under the same lock so two can never be live at once.
    pub fn install_daily_trigger(&self, project: &str, at: TimeOfDay, handler: TriggerHandler) -> NaiveDateTime {
        let next_fire = at.next_after((self.clock)());
        let previous = self.lock().insert(
            project.to_owned(),
            Trigger {
                at,
                next_fire,
                handler,
            },
        );
        match previous {
            Some(old) => info!(project, from = %old.at, to = %at, %next_fire, "rescheduled daily backup"),
            None => info!(project, %at, %next_fire, "scheduled daily backup"),
        }
        next_fire
    }

    pub fn cancel(&self, project: &str) -> bool {
        let removed = self.lock().remove(project).is_some();
        if removed {
            info!(project, "cancelled daily backup");
        }
        removed
    }

    pub fn next_fire(&self, project: &str) -> Option<NaiveDateTime> {
        self.lock().get(project).map(|t| t.next_fire)
    }

    pub fn scheduled_at(&self, project: &str) -> Option<TimeOfDay> {
        self.lock().get(project).map(|t| t.at)
    }

    pub fn projects(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Handlers due at `now`, each advanced to its next occurrence.
    ///
    /// A trigger missed by more than a day fires once, not once per day.
    pub fn take_due(&self, now: NaiveDateTime) -> Vec<(String, TriggerHandler)> {
        let mut due = Vec::new();
        for (project, trigger) in self.lock().iter_mut() {
            if trigger.next_fire <= now {
                trigger.next_fire = trigger.at.next_after(now);
                due.push((project.clone(), Arc::clone(&trigger.handler)));
            }
        }
        due
    }

    /// Re-derives every registered project's trigger, e.g. at startup.
    pub fn reinstall_all(
        &self,
        registry: &ProjectRegistry,
        make_handler: impl Fn(&str) -> TriggerHandler,
    ) -> anyhow::Result<usize> {
        let projects = registry.list()?;
        for project in &projects {
            self.install_daily_trigger(&project.name, project.backup_time, make_handler(&project.name));
        }
        Ok(projects.len())
    }

    /// Polls forever, spawning each due handler as its own task.
    pub async fn run(self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = (self.clock)();
            for (project, handler) in self.take_due(now) {
                debug!(project, %now, "trigger due");
                tokio::spawn(handler());
            }
        }
    }
}
