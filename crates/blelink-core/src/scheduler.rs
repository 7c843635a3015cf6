//! Periodic retry driver for the central role
//!
//! Fires its action immediately on `start`, then every interval until `stop`.
//! `start` on a running scheduler is a no-op, so at most one timer chain
//! exists per instance. The action is fire-and-forget: the scheduler never
//! waits for it, and the action must check the link state itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::lock;
use crate::timer::ScheduledTask;

// ----------------------------------------------------------------------------
// Reconnect Scheduler
// ----------------------------------------------------------------------------

type Action = Arc<dyn Fn() + Send + Sync>;

/// Repeating action with idempotent start and cancelling stop
pub struct ReconnectScheduler {
    interval: Duration,
    action: Action,
    chain: Mutex<Option<ScheduledTask>>,
}

impl ReconnectScheduler {
    pub fn new<F>(interval: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            interval,
            action: Arc::new(action),
            chain: Mutex::new(None),
        }
    }

    /// Start the timer chain; returns `false` if it was already running
    pub fn start(&self) -> bool {
        let mut chain = lock(&self.chain);
        if chain.as_ref().is_some_and(ScheduledTask::is_active) {
            debug!("Reconnect loop already running");
            return false;
        }

        let action = self.action.clone();
        *chain = Some(ScheduledTask::repeating(self.interval, move || action()));
        debug!(
            "Reconnect loop started ({} ms interval)",
            self.interval.as_millis()
        );
        true
    }

    /// Cancel every pending and future invocation
    pub fn stop(&self) {
        if let Some(task) = lock(&self.chain).take() {
            task.cancel();
            debug!("Reconnect loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.chain)
            .as_ref()
            .is_some_and(ScheduledTask::is_active)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
