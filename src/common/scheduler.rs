use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    task::{AbortHandle, JoinHandle},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, Instrument};

use crate::error::{Error, Result};

/// Runs the background work of registries and clients: periodic lookup
/// refreshes, debounced cache flushes and connection tasks.
///
/// A scheduler is created by whoever owns the registry or client and handed
/// to it. Every task spawned through it is aborted by
/// [`Scheduler::shutdown`].
pub struct Scheduler {
    handle: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a scheduler on the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            Error::InvalidArgument("no tokio runtime is running".into())
        })?;
        Ok(Self::new(handle))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns a tracked task. Returns `None` once the scheduler is shut down.
    pub fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.is_shutdown() {
            return None;
        }
        tasks.retain(|task| !task.is_finished());
        let task = self.handle.spawn(task.in_current_span());
        let abort = task.abort_handle();
        tasks.push(task);
        Some(abort)
    }

    pub fn spawn_after<F>(&self, delay: Duration, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            time::sleep(delay).await;
            task.await;
        })
    }

    /// Runs `tick` every `period`, starting one period from now. A tick that
    /// overruns delays the next one rather than bunching them up.
    pub fn spawn_periodic<F, Fut>(
        &self,
        period: Duration,
        mut tick: F,
    ) -> Option<AbortHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            let mut interval =
                time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        })
    }

    /// Aborts every task and refuses new ones.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(tasks = tasks.len(), "scheduler shutting down");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_shutdown() {
        let scheduler = Scheduler::current().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        scheduler.spawn_periodic(Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(scheduler.spawn(async {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_runs_once() {
        let scheduler = Scheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.spawn_after(Duration::from_millis(100), async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();
    }
}
