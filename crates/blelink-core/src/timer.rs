//! Cancellable scheduled callbacks
//!
//! Every timer in the core (reconnect ticks, scan timeouts, the delayed
//! characteristic write) is a [`ScheduledTask`]. Cancelling a task sets its
//! [`CancelToken`] before aborting the tokio task, and the task re-checks the
//! token right before invoking its callback, so a tick that has already been
//! dispatched but not yet run never executes after `cancel` returns.
//!
//! Tasks are spawned on the ambient tokio runtime; creating one outside a
//! runtime context panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Cancel Token
// ----------------------------------------------------------------------------

/// Shared flag that stops a scheduled task from running its callback
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Scheduled Task
// ----------------------------------------------------------------------------

/// A single-shot or repeating callback; cancelled on drop
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancelToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `callback` once after `delay`
    pub fn once<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        let guard = token.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            if !guard.is_cancelled() {
                callback();
            }
        });
        Self { token, handle }
    }

    /// Run `callback` immediately, then every `interval` until cancelled
    pub fn repeating<F>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancelToken::new();
        let guard = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if guard.is_cancelled() {
                    break;
                }
                callback();
            }
        });
        Self { token, handle }
    }

    /// Prevent any further invocation of the callback
    pub fn cancel(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    /// Whether the task can still invoke its callback
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = ScheduledTask::once(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_once_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = ScheduledTask::once(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_fires_immediately_then_periodically() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = ScheduledTask::repeating(Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        drop(task);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
