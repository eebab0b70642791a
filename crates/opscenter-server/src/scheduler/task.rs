//! A single named periodic task with an explicit start/stop state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FleetResult;

/// One iteration of a task. Receives the task's cancellation token.
pub type Job = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, FleetResult<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Stopped,
}

/// How a task ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Finished within the grace period.
    Graceful,
    /// Still running after the grace period and was aborted.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} is already running")]
    AlreadyRunning(&'static str),

    #[error("task {0} needs a non-zero interval")]
    ZeroInterval(&'static str),
}

/// Runs `job` every `interval` until cancelled.
///
/// A failing or panicking iteration is logged and the next tick runs as
/// usual.
pub struct PeriodicTask {
    name: &'static str,
    job: Job,
    state: TaskState,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, job: Job) -> Self {
        Self {
            name,
            job,
            state: TaskState::Idle,
            cancel: None,
            handle: None,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn state(&self) -> TaskState {
        self.state
    }

    pub fn start(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        if self.state == TaskState::Running {
            return Err(SchedulerError::AlreadyRunning(self.name));
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(self.name));
        }

        let name = self.name;
        let job = Arc::clone(&self.job);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = timer.tick() => run_iteration(name, &job, &token).await,
                }
            }
            debug!(task = name, "Task loop exited");
        });

        info!(task = name, interval_secs = interval.as_secs(), "Task started");
        self.cancel = Some(cancel);
        self.handle = Some(handle);
        self.state = TaskState::Running;
        Ok(())
    }

    /// Cancel the task and wait up to `grace` for it to finish.
    ///
    /// Stopping a task that is not running is a no-op.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        if self.state != TaskState::Running {
            return StopOutcome::Graceful;
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.state = TaskState::Stopped;

        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::Graceful;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            info!(task = self.name, "Task stopped");
            StopOutcome::Graceful
        } else {
            handle.abort();
            warn!(task = self.name, grace_secs = grace.as_secs(), "Task aborted after grace period");
            StopOutcome::Aborted
        }
    }
}

async fn run_iteration(name: &'static str, job: &Job, token: &CancellationToken) {
    debug!(task = name, "Task iteration started");
    let started = Instant::now();
    match AssertUnwindSafe(job(token.clone())).catch_unwind().await {
        Ok(Ok(())) => {
            #[allow(clippy::cast_possible_truncation)]
            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(task = name, elapsed_ms, "Task iteration completed");
        }
        Ok(Err(e)) => warn!(task = name, error = %e, "Task iteration failed"),
        Err(_) => error!(task = name, "Task iteration panicked"),
    }
}
