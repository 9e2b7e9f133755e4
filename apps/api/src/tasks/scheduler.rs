//! Scheduler: runs ledger-backed work detached from the request that started it.
//!
//! The scheduler only flips ledger status around the unit of work; the work
//! itself is responsible for writing its own result payload before returning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::task::{StatusUpdate, TaskStatus, CANCELLED_MARKER};
use crate::tasks::ledger::TaskStore;
use crate::telemetry::{self, TaskEvent};

/// Cooperative cancellation handle passed into every unit of work.
/// Cheap to clone; all clones observe the same trip.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that can never trip, for callers outside the scheduler.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the receiver.
        std::mem::forget(tx);
        Self { rx }
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the signal trips. Pends forever if it never does.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|tripped| *tripped).await.is_err() {
            // Sender deregistered without tripping: treat as never-cancelled.
            std::future::pending::<()>().await;
        }
    }
}

struct SchedulerInner {
    store: Arc<dyn TaskStore>,
    registry: Mutex<HashMap<String, watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawns `work` on the runtime, detached from the caller. The ledger row
    /// must already exist in `queued`; rows already terminal (e.g. cancelled
    /// between enqueue and pickup) are skipped without running the work.
    pub fn enqueue<F, Fut>(&self, task_id: String, owner_id: Uuid, work: F)
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.insert(task_id.clone(), tx);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_supervised(inner, task_id, owner_id, work, rx).await;
        });
    }

    /// Trips the cancel signal for a live task. Returns false when the task
    /// is unknown or already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        let registry = self.inner.registry.lock().unwrap();
        match registry.get(task_id) {
            Some(tx) => {
                info!("Cancelling task {task_id}");
                tx.send(true).is_ok()
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, task_id: &str) -> bool {
        self.inner.registry.lock().unwrap().contains_key(task_id)
    }
}

async fn run_supervised<F, Fut>(
    inner: Arc<SchedulerInner>,
    task_id: String,
    owner_id: Uuid,
    work: F,
    rx: watch::Receiver<bool>,
) where
    F: FnOnce(CancelSignal) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    // Pre-run check: skip work the caller already cancelled or that never
    // made it into the ledger.
    match inner.store.get(&task_id, owner_id).await {
        Ok(Some(row)) => {
            if matches!(row.status(), Some(s) if s.is_terminal()) {
                info!("Task {task_id} already terminal ({}), skipping", row.status);
                deregister(&inner, &task_id);
                return;
            }
        }
        Ok(None) => {
            warn!("Task {task_id} has no ledger row, skipping");
            deregister(&inner, &task_id);
            return;
        }
        Err(e) => {
            // Ledger read failure is not fatal; the work still runs.
            warn!("Pre-run ledger read failed for task {task_id}: {e}");
        }
    }

    if let Err(e) = inner
        .store
        .set_status(&task_id, owner_id, StatusUpdate::running())
        .await
    {
        warn!("Failed to mark task {task_id} running: {e}");
    }

    let signal = CancelSignal { rx };

    // The work runs in its own task so a panic surfaces as a JoinError here
    // instead of leaving the row stuck in `running`.
    let handle = tokio::spawn(work(signal.clone()));

    let update = match handle.await {
        _ if signal.is_cancelled() => {
            info!("Task {task_id} cancelled");
            StatusUpdate::failed(CANCELLED_MARKER)
        }
        Ok(Ok(())) => {
            info!("Task {task_id} completed");
            StatusUpdate::completed()
        }
        Ok(Err(e)) => {
            error!("Task {task_id} failed: {e:#}");
            StatusUpdate::failed(e.to_string())
        }
        Err(join_err) => {
            error!("Task {task_id} panicked: {join_err}");
            StatusUpdate::failed(format!("task panicked: {join_err}"))
        }
    };

    match update.status {
        TaskStatus::Completed => telemetry::emit(&TaskEvent::TaskCompleted {
            task_id: &task_id,
            owner_id,
        }),
        TaskStatus::Failed => telemetry::emit(&TaskEvent::TaskFailed {
            task_id: &task_id,
            owner_id,
            error: update.error.as_deref().unwrap_or(""),
        }),
        _ => {}
    }

    if let Err(e) = inner.store.set_status(&task_id, owner_id, update).await {
        error!("Failed to record final status for task {task_id}: {e}");
    }

    deregister(&inner, &task_id);
}

fn deregister(inner: &SchedulerInner, task_id: &str) {
    inner.registry.lock().unwrap().remove(task_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::{NewTask, TaskStatus};
    use crate::tasks::ledger::memory::MemoryTaskStore;
    use std::time::Duration;

    async fn seed(store: &MemoryTaskStore, id: &str) -> Uuid {
        let owner = Uuid::new_v4();
        store
            .create(NewTask {
                id: id.to_string(),
                owner_id: owner,
                kind: "cv_generation".to_string(),
                title: "Generate CV".to_string(),
                device_id: None,
                should_refresh_list: false,
                created_at: 0,
            })
            .await
            .unwrap();
        owner
    }

    async fn wait_for_terminal(store: &MemoryTaskStore, id: &str) -> TaskStatus {
        for _ in 0..200 {
            if let Some(row) = store.snapshot(id) {
                if let Some(status) = row.status() {
                    if status.is_terminal() {
                        return status;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successful_work_marks_completed() {
        let store = Arc::new(MemoryTaskStore::new());
        let owner = seed(&store, "ok").await;
        let scheduler = Scheduler::new(store.clone());

        scheduler.enqueue("ok".to_string(), owner, |_signal| async { Ok(()) });

        assert_eq!(wait_for_terminal(&store, "ok").await, TaskStatus::Completed);
        assert!(!scheduler.is_registered("ok"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_work_records_error_message() {
        let store = Arc::new(MemoryTaskStore::new());
        let owner = seed(&store, "bad").await;
        let scheduler = Scheduler::new(store.clone());

        scheduler.enqueue("bad".to_string(), owner, |_signal| async {
            anyhow::bail!("extraction exploded")
        });

        assert_eq!(wait_for_terminal(&store, "bad").await, TaskStatus::Failed);
        let row = store.snapshot("bad").unwrap();
        assert_eq!(row.error.as_deref(), Some("extraction exploded"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_trips_signal_and_records_marker() {
        let store = Arc::new(MemoryTaskStore::new());
        let owner = seed(&store, "slow").await;
        let scheduler = Scheduler::new(store.clone());

        scheduler.enqueue("slow".to_string(), owner, |mut signal| async move {
            signal.cancelled().await;
            Ok(())
        });

        // Give the supervisor a moment to register and start the work.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.cancel("slow"));

        assert_eq!(wait_for_terminal(&store, "slow").await, TaskStatus::Failed);
        let row = store.snapshot("slow").unwrap();
        assert!(row.is_cancelled());
        assert!(!scheduler.is_registered("slow"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_work_still_reaches_failed() {
        let store = Arc::new(MemoryTaskStore::new());
        let owner = seed(&store, "boom").await;
        let scheduler = Scheduler::new(store.clone());

        scheduler.enqueue("boom".to_string(), owner, |_signal| async {
            panic!("unexpected");
        });

        assert_eq!(wait_for_terminal(&store, "boom").await, TaskStatus::Failed);
        let row = store.snapshot("boom").unwrap();
        assert!(row.error.unwrap().contains("panicked"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_already_terminal_task_is_skipped() {
        let store = Arc::new(MemoryTaskStore::new());
        let owner = seed(&store, "done").await;
        store
            .set_status("done", owner, StatusUpdate::failed(CANCELLED_MARKER))
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_flag = ran.clone();
        scheduler.enqueue("done".to_string(), owner, move |_signal| async move {
            ran_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        let row = store.snapshot("done").unwrap();
        assert!(row.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_tasks_report_independent_status() {
        let store = Arc::new(MemoryTaskStore::new());
        let short_owner = seed(&store, "short").await;
        let long_owner = seed(&store, "long").await;
        let scheduler = Scheduler::new(store.clone());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        scheduler.enqueue("long".to_string(), long_owner, |_signal| async move {
            let _ = release_rx.await;
            Ok(())
        });
        scheduler.enqueue("short".to_string(), short_owner, |_signal| async { Ok(()) });

        assert_eq!(
            wait_for_terminal(&store, "short").await,
            TaskStatus::Completed
        );

        for _ in 0..200 {
            if store.snapshot("long").unwrap().status() == Some(TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            store.snapshot("long").unwrap().status(),
            Some(TaskStatus::Running)
        );

        let _ = release_tx.send(());
        assert_eq!(wait_for_terminal(&store, "long").await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_returns_false() {
        let store = Arc::new(MemoryTaskStore::new());
        let scheduler = Scheduler::new(store);
        assert!(!scheduler.cancel("ghost"));
    }
}
