//! Background task handles.
//!
//! A [`TaskGroup`] owns a set of tokio tasks that share one shutdown signal.
//! Stopping the group signals shutdown and then joins every task, so nothing
//! the tasks do can be observed after `stop` returns.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How long `stop` waits for a task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(10);

pub(crate) struct TaskGroup {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub(crate) fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver that observes this group's shutdown signal.
    ///
    /// Take it before spawning the task that uses it.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Signals shutdown and waits for every task to finish.
    ///
    /// Tasks that ignore the signal past the grace period are aborted, and
    /// still joined.
    pub(crate) async fn stop(self) {
        debug!(group = self.name, tasks = self.handles.len(), "Stopping task group");
        self.shutdown_tx.send_replace(true);

        for mut handle in self.handles {
            let result = match tokio::time::timeout(STOP_GRACE, &mut handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(group = self.name, "Task ignored shutdown, aborting");
                    handle.abort();
                    handle.await
                }
            };

            if let Err(e) = result {
                if e.is_panic() {
                    error!(group = self.name, error = %e, "Background task panicked");
                }
            }
        }
    }
}

/// Waits for the shutdown signal. Also resolves if the group was dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stop_joins_all_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new("test");

        for _ in 0..3 {
            let mut shutdown = group.shutdown_signal();
            let finished = Arc::clone(&finished);
            group.spawn(async move {
                shutdown_requested(&mut shutdown).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 3);

        group.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_before_first_poll() {
        let mut group = TaskGroup::new("test");
        let mut shutdown = group.shutdown_signal();
        group.spawn(async move {
            shutdown_requested(&mut shutdown).await;
        });

        tokio::time::timeout(Duration::from_secs(1), group.stop())
            .await
            .expect("stop should not hang");
    }

    #[tokio::test]
    async fn test_dropped_group_releases_tasks() {
        let group = TaskGroup::new("test");
        let mut shutdown = group.shutdown_signal();
        let task = tokio::spawn(async move {
            shutdown_requested(&mut shutdown).await;
        });

        drop(group);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should observe the dropped sender")
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_stop() {
        let mut group = TaskGroup::new("test");
        group.spawn(async { panic!("poll loop bug") });
        tokio::task::yield_now().await;
        group.stop().await;
    }
}
