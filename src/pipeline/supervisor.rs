//! Task supervisor
//!
//! Every background task (workers, compute loops, pollers) is spawned
//! through the supervisor so shutdown can cancel and join all of them.
//! Nothing in the service is fire-and-forget; leaked workers across
//! reconnects show up here as handles that never joined.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns spawned task handles and the cooperative shutdown signal
#[derive(Debug)]
pub struct TaskSupervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Receiver tasks watch to observe shutdown
    ///
    /// Tasks must observe it within one queue-poll interval.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn a supervised task
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Spawning supervised task");
        let handle = tokio::spawn(future);
        self.handles
            .lock()
            .expect("supervisor handle list poisoned")
            .push((name, handle));
    }

    /// Signal shutdown and join every task, aborting stragglers
    pub async fn shutdown(&self, grace: Duration) {
        info!("Supervisor shutdown initiated");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut guard = self
                .handles
                .lock()
                .expect("supervisor handle list poisoned");
            guard.drain(..).collect()
        };

        for (name, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task joined"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task join error"),
                Err(_) => {
                    warn!(task = %name, grace_ms = grace.as_millis() as u64, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!("Supervisor shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooperative_task_joins_on_shutdown() {
        let supervisor = TaskSupervisor::new();
        let mut shutdown = supervisor.subscribe();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        supervisor.spawn("worker", async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
            let _ = done_tx.send(());
        });

        supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let supervisor = TaskSupervisor::new();

        supervisor.spawn("stuck", async {
            // Ignores the shutdown signal entirely
            std::future::pending::<()>().await;
        });

        // Must return despite the stuck task
        tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.shutdown(Duration::from_millis(20)),
        )
        .await
        .expect("shutdown must not hang on a stuck task");
    }

    #[tokio::test]
    async fn test_is_shutting_down_flag() {
        let supervisor = TaskSupervisor::new();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown(Duration::from_millis(10)).await;
        assert!(supervisor.is_shutting_down());
    }
}
