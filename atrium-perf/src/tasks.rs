//! Background task scheduler.
//!
//! Tasks are queued by priority (critical > high > medium > low, FIFO within
//! a priority) and drained one at a time by a single tokio task that is
//! spawned on demand and exits when the queue runs dry.

use crate::{PerfError, Result};
use atrium_types::TaskId;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub plugin_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
}

impl TaskSpec {
    pub fn new(
        plugin_id: impl Into<String>,
        task_type: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            task_type: task_type.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub plugin_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Percent complete, 0-100.
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The work itself. Receives a progress reporter.
pub type TaskJob =
    Box<dyn FnOnce(TaskProgress) -> BoxFuture<'static, std::result::Result<(), String>> + Send>;

/// Handle a running job uses to report progress.
#[derive(Clone)]
pub struct TaskProgress {
    id: TaskId,
    inner: Arc<SchedulerInner>,
}

impl TaskProgress {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Records progress, clamped to 100.
    pub fn set(&self, percent: u8) {
        self.inner.update(self.id, |task| task.progress = percent.min(100));
    }
}

struct Queued {
    priority: TaskPriority,
    seq: u64,
    id: TaskId,
    plugin_id: String,
    job: TaskJob,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerInner {
    queue: Mutex<BinaryHeap<Queued>>,
    tasks: Mutex<Vec<BackgroundTask>>,
    draining: AtomicBool,
    seq: AtomicU64,
    idle: Notify,
}

impl SchedulerInner {
    fn update(&self, id: TaskId, f: impl FnOnce(&mut BackgroundTask)) {
        if let Some(task) = self.tasks.lock().iter_mut().find(|t| t.id == id) {
            f(task);
        }
    }

    fn is_idle(&self) -> bool {
        !self.draining.load(AtomicOrdering::Acquire) && self.queue.lock().is_empty()
    }
}

/// Priority scheduler for plugin background work.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `job` and makes sure the drain loop is running. Must be
    /// called from within a tokio runtime.
    pub fn schedule(&self, spec: TaskSpec, job: TaskJob) -> Result<TaskId> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| PerfError::NoRuntime)?;
        let id = TaskId::new();
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);

        self.inner.tasks.lock().push(BackgroundTask {
            id,
            plugin_id: spec.plugin_id.clone(),
            task_type: spec.task_type.clone(),
            priority: spec.priority,
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        });
        self.inner.queue.lock().push(Queued {
            priority: spec.priority,
            seq,
            id,
            plugin_id: spec.plugin_id.clone(),
            job,
        });
        debug!(
            task_id = %id,
            plugin_id = %spec.plugin_id,
            task_type = %spec.task_type,
            priority = ?spec.priority,
            "Background task scheduled"
        );

        if !self.inner.draining.swap(true, AtomicOrdering::AcqRel) {
            handle.spawn(drain(Arc::clone(&self.inner)));
        }
        Ok(id)
    }

    /// Snapshot of every known task in scheduling order.
    pub fn tasks(&self) -> Vec<BackgroundTask> {
        self.inner.tasks.lock().clone()
    }

    pub fn task(&self, id: TaskId) -> Option<BackgroundTask> {
        self.inner.tasks.lock().iter().find(|t| t.id == id).cloned()
    }

    /// Fails every pending task of `plugin_id`. Running tasks finish.
    pub fn cancel_plugin_tasks(&self, plugin_id: &str) -> usize {
        let mut cancelled = Vec::new();
        self.inner.queue.lock().retain(|q| {
            if q.plugin_id == plugin_id {
                cancelled.push(q.id);
                false
            } else {
                true
            }
        });
        let now = Utc::now();
        for id in &cancelled {
            self.inner.update(*id, |task| {
                task.status = TaskStatus::Failed;
                task.error = Some("cancelled: plugin unloaded".to_string());
                task.finished_at = Some(now);
            });
        }
        if !cancelled.is_empty() {
            info!(plugin_id = %plugin_id, count = cancelled.len(), "Pending background tasks cancelled");
        }
        cancelled.len()
    }

    /// Drops completed and failed tasks from the snapshot list.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running));
        before - tasks.len()
    }

    /// Resolves once the queue is empty and no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(inner: Arc<SchedulerInner>) {
    loop {
        let next = inner.queue.lock().pop();
        let Some(queued) = next else {
            inner.draining.store(false, AtomicOrdering::Release);
            // A task may have been pushed after the pop but before the store.
            let pending = !inner.queue.lock().is_empty();
            if pending && !inner.draining.swap(true, AtomicOrdering::AcqRel) {
                continue;
            }
            inner.idle.notify_waiters();
            return;
        };
        run(&inner, queued).await;
    }
}

async fn run(inner: &Arc<SchedulerInner>, queued: Queued) {
    let id = queued.id;
    inner.update(id, |task| {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
    });

    let progress = TaskProgress {
        id,
        inner: Arc::clone(inner),
    };
    let outcome = AssertUnwindSafe((queued.job)(progress)).catch_unwind().await;
    let outcome = match outcome {
        Ok(result) => result,
        Err(_) => Err("background task panicked".to_string()),
    };

    let now = Utc::now();
    match outcome {
        Ok(()) => inner.update(id, |task| {
            task.status = TaskStatus::Completed;
            task.progress = 100;
            task.finished_at = Some(now);
        }),
        Err(message) => {
            warn!(task_id = %id, plugin_id = %queued.plugin_id, error = %message, "Background task failed");
            inner.update(id, |task| {
                task.status = TaskStatus::Failed;
                task.error = Some(message);
                task.finished_at = Some(now);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;

    fn job<F>(f: F) -> TaskJob
    where
        F: FnOnce(TaskProgress) -> std::result::Result<(), String> + Send + 'static,
    {
        Box::new(move |progress| async move { f(progress) }.boxed())
    }

    #[test]
    fn schedule_outside_runtime_fails() {
        let scheduler = TaskScheduler::new();
        let err = scheduler
            .schedule(TaskSpec::new("p", "index", TaskPriority::Low), job(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(err, PerfError::NoRuntime));
    }

    #[tokio::test]
    async fn drains_by_priority_then_fifo() {
        let scheduler = TaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the drain loop until everything is queued.
        let (release, gate) = oneshot::channel::<()>();
        scheduler
            .schedule(
                TaskSpec::new("p", "gate", TaskPriority::Critical),
                Box::new(move |_| {
                    async move {
                        let _ = gate.await;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .unwrap();
        tokio::task::yield_now().await;

        for (name, priority) in [
            ("low", TaskPriority::Low),
            ("high-1", TaskPriority::High),
            ("medium", TaskPriority::Medium),
            ("critical", TaskPriority::Critical),
            ("high-2", TaskPriority::High),
        ] {
            let order = Arc::clone(&order);
            scheduler
                .schedule(
                    TaskSpec::new("p", name, priority),
                    job(move |_| {
                        order.lock().push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        release.send(()).unwrap();
        scheduler.wait_idle().await;
        assert_eq!(
            *order.lock(),
            vec!["critical", "high-1", "high-2", "medium", "low"]
        );
    }

    #[tokio::test]
    async fn failure_and_panic_recorded() {
        let scheduler = TaskScheduler::new();
        let failed = scheduler
            .schedule(
                TaskSpec::new("p", "fail", TaskPriority::Medium),
                job(|_| Err("disk full".to_string())),
            )
            .unwrap();
        let panicked = scheduler
            .schedule(
                TaskSpec::new("p", "panic", TaskPriority::Medium),
                job(|_| panic!("boom")),
            )
            .unwrap();
        let done = scheduler
            .schedule(
                TaskSpec::new("p", "ok", TaskPriority::Medium),
                job(|progress| {
                    progress.set(40);
                    Ok(())
                }),
            )
            .unwrap();
        scheduler.wait_idle().await;

        let failed = scheduler.task(failed).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert_eq!(scheduler.task(panicked).unwrap().status, TaskStatus::Failed);
        let done = scheduler.task(done).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_fails_only_pending_tasks_of_plugin() {
        let scheduler = TaskScheduler::new();
        let (release, gate) = oneshot::channel::<()>();
        scheduler
            .schedule(
                TaskSpec::new("keep", "gate", TaskPriority::Critical),
                Box::new(move |_| {
                    async move {
                        let _ = gate.await;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .unwrap();
        tokio::task::yield_now().await;

        let gone = scheduler
            .schedule(TaskSpec::new("gone", "sync", TaskPriority::Low), job(|_| Ok(())))
            .unwrap();
        let kept = scheduler
            .schedule(TaskSpec::new("keep", "sync", TaskPriority::Low), job(|_| Ok(())))
            .unwrap();

        assert_eq!(scheduler.cancel_plugin_tasks("gone"), 1);
        release.send(()).unwrap();
        scheduler.wait_idle().await;

        assert_eq!(scheduler.task(gone).unwrap().status, TaskStatus::Failed);
        assert_eq!(scheduler.task(kept).unwrap().status, TaskStatus::Completed);
        assert_eq!(scheduler.clear_finished(), 3);
        assert!(scheduler.tasks().is_empty());
    }
}
