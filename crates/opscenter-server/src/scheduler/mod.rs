//! Reconciliation scheduler: independent, cancellable periodic tasks.

mod jobs;
mod task;

pub use jobs::{INVENTORY_RESYNC, PENDING_PROBE, READY_PROBE, UPDATE_REFRESH};
pub use task::{Job, PeriodicTask, SchedulerError, StopOutcome, TaskState};

use std::time::Duration;

use opscenter_core::config::TaskIntervals;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::provisioning::Fleet;

/// Owns the running tasks and their shared parent cancellation token.
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
    cancel: CancellationToken,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the standard reconciliation tasks; zero intervals are skipped.
    pub fn start_fleet(fleet: &Fleet, intervals: &TaskIntervals) -> Result<Self, SchedulerError> {
        let mut scheduler = Self::new();
        scheduler.spawn(
            UPDATE_REFRESH,
            intervals.update_refresh_secs,
            jobs::update_refresh(fleet.clone()),
        )?;
        scheduler.spawn(
            PENDING_PROBE,
            intervals.pending_probe_secs,
            jobs::pending_probe(fleet.clone()),
        )?;
        scheduler.spawn(
            READY_PROBE,
            intervals.ready_probe_secs,
            jobs::ready_probe(fleet.clone()),
        )?;
        scheduler.spawn(
            INVENTORY_RESYNC,
            intervals.inventory_resync_secs,
            jobs::inventory_resync(fleet.clone()),
        )?;
        Ok(scheduler)
    }

    /// Start `job` every `interval_secs`; a zero interval disables it.
    pub fn spawn(
        &mut self,
        name: &'static str,
        interval_secs: u64,
        job: Job,
    ) -> Result<(), SchedulerError> {
        if interval_secs == 0 {
            info!(task = name, "Task disabled");
            return Ok(());
        }
        self.spawn_every(name, Duration::from_secs(interval_secs), job)
    }

    fn spawn_every(
        &mut self,
        name: &'static str,
        interval: Duration,
        job: Job,
    ) -> Result<(), SchedulerError> {
        let mut task = PeriodicTask::new(name, job);
        task.start(interval, self.cancel.child_token())?;
        self.tasks.push(task);
        Ok(())
    }

    /// Names of the tasks that were started.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PeriodicTask::name).collect()
    }

    /// Cancel every task, then give each up to `grace` to finish.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<(&'static str, StopOutcome)> {
        self.cancel.cancel();
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in &mut self.tasks {
            outcomes.push((task.name(), task.stop(grace).await));
        }
        info!(tasks = outcomes.len(), "Scheduler stopped");
        outcomes
    }
}
