//! Cancellable delayed tasks

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to work scheduled with [`schedule_after`]. Dropping the handle does not cancel it.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancel the task if it has not run yet
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `task` once `delay` has elapsed on the current tokio runtime.
pub fn schedule_after<F>(delay: Duration, task: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    });
    ScheduledTask { handle }
}
