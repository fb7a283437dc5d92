//! Task engine.
//!
//! Every state-changing operation runs as a task: a future executed on a
//! bounded worker pool, observable through [`TaskInfo`] snapshots that are
//! also published on the update feed.
//!
//! Tasks targeting the same object queue behind each other in submission
//! order. Tasks on different objects run concurrently, up to the pool size.
//! A queued task does not hold a worker slot.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DynamicId, DynamicValue, SubTask, TaskInfo, TaskState};
use crate::updates::Updates;

/// Default number of tasks that may execute at once.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

struct TaskEntry {
    info: Mutex<TaskInfo>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl TaskEntry {
    fn info(&self) -> MutexGuard<'_, TaskInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> TaskInfo {
        self.info().clone()
    }
}

/// Handle given to a running task body.
#[derive(Clone)]
pub struct TaskContext {
    entry: Arc<TaskEntry>,
    updates: Arc<Updates>,
    id: String,
}

impl TaskContext {
    /// Id of the running task.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Debug token of the caller that submitted the task.
    pub fn dbg(&self) -> String {
        self.entry.info().dbg.clone()
    }

    /// Report progress. Values below the last report are ignored.
    pub fn set_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        let mut info = self.entry.info();
        if let TaskState::Pending { progress: current } = info.state {
            if progress > current {
                info.state = TaskState::Pending { progress };
                self.publish(&info);
            }
        }
    }

    /// Fail with `Cancelled` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.entry.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                task: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Token that fires when cancellation is requested.
    pub fn cancellation(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }

    /// Run `fut`, giving up with `Cancelled` as soon as cancellation is
    /// requested. Whatever `fut` had already done stays done.
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.entry.cancel.cancelled() => Err(Error::Cancelled {
                task: self.id.clone(),
            }),
        }
    }

    /// Run one named step of a composite task.
    ///
    /// The step is recorded in the task's sub-task list with its own state.
    /// A cancellation checkpoint runs before the step starts.
    pub async fn subtask<T, F>(&self, name: &str, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.checkpoint()?;

        let index = {
            let mut info = self.entry.info();
            info.subtasks.push(SubTask {
                name: name.to_string(),
                state: TaskState::Pending { progress: 0.0 },
            });
            self.publish(&info);
            info.subtasks.len() - 1
        };

        let started = Instant::now();
        let result = step.await;

        let state = match &result {
            Ok(_) => TaskState::Completed {
                duration_secs: started.elapsed().as_secs_f64(),
                result: None,
            },
            Err(e) => TaskState::Failed {
                error: e.clone(),
                backtrace: String::new(),
            },
        };
        let mut info = self.entry.info();
        if let Some(subtask) = info.subtasks.get_mut(index) {
            subtask.state = state;
        }
        self.publish(&info);
        drop(info);

        result
    }

    fn publish(&self, info: &TaskInfo) {
        self.updates
            .record(DynamicId::Task(info.id.clone()), DynamicValue::Task(info.clone()));
    }
}

/// Per-object FIFO queues.
///
/// Each submission takes the previous submission's completion signal for
/// the same key and installs its own, so tasks on one object start in the
/// order they were submitted. A key is dropped once its last task leaves.
#[derive(Default)]
struct ObjectQueues {
    queues: Mutex<HashMap<String, ObjectQueue>>,
}

#[derive(Default)]
struct ObjectQueue {
    /// Queued and running tasks, oldest first
    tasks: Vec<String>,
    tail: Option<oneshot::Receiver<()>>,
}

impl ObjectQueues {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ObjectQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, key: &str, task: &str) -> (Option<oneshot::Receiver<()>>, QueueSlot) {
        let (tx, rx) = oneshot::channel();
        let mut queues = self.lock();
        let queue = queues.entry(key.to_string()).or_default();
        queue.tasks.push(task.to_string());
        let previous = queue.tail.replace(rx);
        let slot = QueueSlot {
            queues: self.clone(),
            key: key.to_string(),
            task: task.to_string(),
            left: false,
            _next: tx,
        };
        (previous, slot)
    }

    fn leave(&self, key: &str, task: &str) {
        let mut queues = self.lock();
        if let Some(queue) = queues.get_mut(key) {
            queue.tasks.retain(|t| t != task);
            if queue.tasks.is_empty() {
                queues.remove(key);
            }
        }
    }

    /// Oldest task queued or running on `key`.
    fn busy(&self, key: &str) -> Option<String> {
        self.lock().get(key).and_then(|q| q.tasks.first().cloned())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A task's place in its object queue.
///
/// Leaving the queue and waking the next task are separate steps. The task
/// leaves before its terminal state is written, so a caller that saw it
/// finish never finds the object busy on its account. The next queued task
/// is woken after the terminal state is written.
struct QueueSlot {
    queues: Arc<ObjectQueues>,
    key: String,
    task: String,
    left: bool,
    _next: oneshot::Sender<()>,
}

impl QueueSlot {
    fn leave(&mut self) {
        if !self.left {
            self.queues.leave(&self.key, &self.task);
            self.left = true;
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.leave();
    }
}

/// The task engine.
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    pool: Arc<Semaphore>,
    pool_size: Mutex<usize>,
    queues: Arc<ObjectQueues>,
    updates: Arc<Updates>,
}

impl TaskManager {
    /// Create a task engine with `pool_size` workers.
    pub fn new(pool_size: usize, updates: Arc<Updates>) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            tasks: RwLock::new(HashMap::new()),
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size: Mutex::new(pool_size),
            queues: Arc::new(ObjectQueues::default()),
            updates,
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<TaskEntry>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| Error::internal("Lock poisoned"))?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::does_not_exist(crate::model::ObjectKind::Task, id))
    }

    /// Start a task and return its id immediately.
    ///
    /// When `queue` is set, the task waits for earlier tasks submitted with
    /// the same key before it takes a worker slot.
    pub fn submit<F, Fut>(&self, dbg: &str, name: &str, queue: Option<&str>, body: F) -> String
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let info = TaskInfo {
            id: id.clone(),
            name: name.to_string(),
            dbg: dbg.to_string(),
            created_at: Utc::now(),
            state: TaskState::Pending { progress: 0.0 },
            subtasks: Vec::new(),
            cancel_requested: false,
        };
        let (done, _) = watch::channel(false);
        let entry = Arc::new(TaskEntry {
            info: Mutex::new(info.clone()),
            cancel: CancellationToken::new(),
            done,
        });

        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert(id.clone(), entry.clone());
        }
        self.updates
            .record_created(DynamicId::Task(id.clone()), DynamicValue::Task(info));

        let turn = queue.map(|key| self.queues.enqueue(key, &id));
        let ctx = TaskContext {
            entry,
            updates: self.updates.clone(),
            id: id.clone(),
        };
        let pool = self.pool.clone();
        let span = info_span!("task", task_id = %id, name, dbg);

        tokio::spawn(
            async move {
                // Held until the task is finished; dropping it lets the next
                // task on the same object start.
                let mut slot = match turn {
                    Some((previous, slot)) => {
                        if let Some(previous) = previous {
                            let _ = previous.await;
                        }
                        Some(slot)
                    }
                    None => None,
                };

                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        if let Some(slot) = slot.as_mut() {
                            slot.leave();
                        }
                        finish(&ctx, Err(Error::internal("worker pool closed")), Duration::ZERO);
                        return;
                    }
                };

                debug!("Task started");
                let started = Instant::now();
                let outcome = match ctx.checkpoint() {
                    Err(e) => Err(e),
                    Ok(()) => {
                        let body_ctx = ctx.clone();
                        match AssertUnwindSafe(async move { body(body_ctx).await })
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(panic) => Err(Error::internal(format!("task panicked: {}", panic_message(panic.as_ref())))),
                        }
                    }
                };
                if let Some(slot) = slot.as_mut() {
                    slot.leave();
                }
                finish(&ctx, outcome, started.elapsed());
                drop(slot);
            }
            .instrument(span),
        );

        id
    }

    /// Snapshot of a task.
    pub fn stat(&self, id: &str) -> Result<TaskInfo> {
        Ok(self.entry(id)?.snapshot())
    }

    /// Snapshots of all tasks, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let tasks = match self.tasks.read() {
            Ok(tasks) => tasks,
            Err(_) => return Vec::new(),
        };
        let mut all: Vec<TaskInfo> = tasks.values().map(|e| e.snapshot()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Wait up to `timeout` for a task to reach a terminal state, then
    /// return its snapshot, terminal or not.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<TaskInfo> {
        let entry = self.entry(id)?;
        let mut rx = entry.done.subscribe();
        if tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await.is_err() {
            debug!(task_id = %id, "Wait timed out");
        }
        Ok(entry.snapshot())
    }

    /// Request cooperative cancellation.
    ///
    /// Idempotent. A no-op on a task that has already finished.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let mut info = entry.info();
        if info.state.is_terminal() || info.cancel_requested {
            return Ok(());
        }
        info.cancel_requested = true;
        self.updates
            .record(DynamicId::Task(id.to_string()), DynamicValue::Task(info.clone()));
        drop(info);

        entry.cancel.cancel();
        info!(task_id = %id, "Task cancellation requested");
        Ok(())
    }

    /// Forget a finished task.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if !entry.info().state.is_terminal() {
            return Err(Error::TaskInProgress { task: id.to_string() });
        }

        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| Error::internal("Lock poisoned"))?;
        tasks.remove(id);
        self.updates.record_removed(DynamicId::Task(id.to_string()));
        debug!(task_id = %id, "Task destroyed");
        Ok(())
    }

    /// Fail with `TaskInProgress` if a task on `key` is queued or running.
    pub fn check_idle(&self, key: &str) -> Result<()> {
        match self.queues.busy(key) {
            Some(task) => Err(Error::TaskInProgress { task }),
            None => Ok(()),
        }
    }

    /// Current worker pool size.
    pub fn pool_size(&self) -> usize {
        *self.pool_size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resize the worker pool.
    ///
    /// Growing takes effect immediately. Shrinking takes effect as running
    /// tasks release their slots.
    pub fn set_pool_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid_argument("worker pool size must be at least 1"));
        }

        let mut current = self.pool_size.lock().unwrap_or_else(PoisonError::into_inner);
        if size > *current {
            self.pool.add_permits(size - *current);
        } else if size < *current {
            let excess = (*current - size) as u32;
            let pool = self.pool.clone();
            tokio::spawn(async move {
                match pool.acquire_many_owned(excess).await {
                    Ok(permits) => permits.forget(),
                    Err(_) => warn!("Worker pool closed while shrinking"),
                }
            });
        }

        info!(from = *current, to = size, "Worker pool resized");
        *current = size;
        Ok(())
    }
}

/// Write the terminal state. Runs exactly once per task, from the worker.
fn finish(ctx: &TaskContext, outcome: Result<Option<Value>>, elapsed: Duration) {
    let mut info = ctx.entry.info();
    if info.state.is_terminal() {
        return;
    }

    info.state = match outcome {
        Ok(result) => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "Task completed");
            TaskState::Completed {
                duration_secs: elapsed.as_secs_f64(),
                result,
            }
        }
        Err(e) => {
            error!(error = %e, "Task failed");
            TaskState::Failed {
                error: e,
                backtrace: Backtrace::force_capture().to_string(),
            }
        }
    };
    ctx.publish(&info);
    drop(info);

    ctx.entry.done.send_replace(true);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(pool: usize) -> (TaskManager, Arc<Updates>) {
        let updates = Arc::new(Updates::default());
        (TaskManager::new(pool, updates.clone()), updates)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_submit_returns_before_completion() {
        let (tasks, _) = manager(4);
        let (tx, rx) = oneshot::channel::<()>();
        let id = tasks.submit("test", "Test.block", None, move |_| async move {
            let _ = rx.await;
            Ok(None)
        });

        assert!(matches!(tasks.stat(&id).unwrap().state, TaskState::Pending { .. }));
        tx.send(()).unwrap();

        let info = tasks.wait(&id, WAIT).await.unwrap();
        assert!(matches!(info.state, TaskState::Completed { result: None, .. }));
    }

    #[tokio::test]
    async fn test_error_and_panic_become_failed() {
        let (tasks, _) = manager(4);
        let failing = tasks.submit("test", "Test.fail", None, |_| async {
            Err(Error::NoBootableDevice)
        });
        let panicking = tasks.submit("test", "Test.panic", None, |_| async {
            if true {
                panic!("boom");
            }
            Ok(None)
        });

        match tasks.wait(&failing, WAIT).await.unwrap().state {
            TaskState::Failed { error, backtrace } => {
                assert_eq!(error, Error::NoBootableDevice);
                assert!(!backtrace.is_empty());
            }
            other => panic!("unexpected state: {:?}", other),
        }
        match tasks.wait(&panicking, WAIT).await.unwrap().state {
            TaskState::Failed { error: Error::Internal { message }, .. } => assert!(message.contains("boom")),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (tasks, _) = manager(4);
        let (tx, rx) = oneshot::channel::<()>();
        let id = tasks.submit("test", "Test.progress", None, move |ctx| async move {
            ctx.set_progress(0.6);
            ctx.set_progress(0.3);
            let _ = rx.await;
            Ok(None)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tasks.stat(&id).unwrap().state, TaskState::Pending { progress: 0.6 });
        tx.send(()).unwrap();
        tasks.wait(&id, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_subtasks_are_recorded_in_order() {
        let (tasks, _) = manager(4);
        let id = tasks.submit("test", "Test.steps", None, |ctx| async move {
            ctx.subtask("first", async { Ok(()) }).await?;
            ctx.subtask("second", async { Err::<(), _>(Error::NoBootableDevice) }).await?;
            Ok(None)
        });

        let info = tasks.wait(&id, WAIT).await.unwrap();
        let names: Vec<&str> = info.subtasks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(matches!(info.subtasks[0].state, TaskState::Completed { .. }));
        assert!(matches!(info.subtasks[1].state, TaskState::Failed { .. }));
        assert!(matches!(info.state, TaskState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_is_observed_at_checkpoint() {
        let (tasks, _) = manager(4);
        let id = tasks.submit("test", "Test.cancel", None, |ctx| async move {
            ctx.cancellation().cancelled().await;
            ctx.checkpoint()?;
            Ok(None)
        });

        tasks.cancel(&id).unwrap();
        tasks.cancel(&id).unwrap();

        let info = tasks.wait(&id, WAIT).await.unwrap();
        assert!(info.cancel_requested);
        assert!(matches!(
            info.state,
            TaskState::Failed { error: Error::Cancelled { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let (tasks, _) = manager(4);
        let id = tasks.submit("test", "Test.done", None, |_| async { Ok(Some(Value::from(42))) });
        let done = tasks.wait(&id, WAIT).await.unwrap();

        tasks.cancel(&id).unwrap();
        let after = tasks.stat(&id).unwrap();
        assert_eq!(after, done);
        assert!(!after.cancel_requested);
    }

    #[tokio::test]
    async fn test_destroy_requires_terminal_task() {
        let (tasks, updates) = manager(4);
        let (tx, rx) = oneshot::channel::<()>();
        let id = tasks.submit("test", "Test.destroy", None, move |_| async move {
            let _ = rx.await;
            Ok(None)
        });

        assert!(matches!(tasks.destroy(&id), Err(Error::TaskInProgress { .. })));
        tx.send(()).unwrap();
        tasks.wait(&id, WAIT).await.unwrap();

        tasks.destroy(&id).unwrap();
        assert!(matches!(tasks.stat(&id), Err(Error::DoesNotExist { .. })));

        let batch = updates.get(0, Duration::ZERO).await;
        let last = batch.entries.last().unwrap();
        assert!(matches!(
            &last.entry,
            crate::updates::FeedEntry::Update { value: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_same_object_runs_in_submission_order() {
        let (tasks, _) = manager(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();

        for i in 0..5 {
            let order = order.clone();
            ids.push(tasks.submit("test", "Test.ordered", Some("vm-1"), move |_| async move {
                tokio::time::sleep(Duration::from_millis(5 * (5 - i) as u64)).await;
                order.lock().unwrap().push(i);
                Ok(None)
            }));
        }
        for id in &ids {
            tasks.wait(id, WAIT).await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_object_is_busy_until_its_last_task_finishes() {
        let (tasks, _) = manager(4);
        let (tx, rx) = oneshot::channel::<()>();
        let first = tasks.submit("test", "Test.block", Some("vm-1"), move |_| async move {
            let _ = rx.await;
            Ok(None)
        });
        let second = tasks.submit("test", "Test.queued", Some("vm-1"), |_| async { Ok(None) });

        match tasks.check_idle("vm-1") {
            Err(Error::TaskInProgress { task }) => assert_eq!(task, first),
            other => panic!("expected TaskInProgress, got {:?}", other),
        }
        tasks.check_idle("vm-2").unwrap();

        tx.send(()).unwrap();
        tasks.wait(&first, WAIT).await.unwrap();
        tasks.wait(&second, WAIT).await.unwrap();

        tasks.check_idle("vm-1").unwrap();
        assert_eq!(tasks.queues.len(), 0);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let (tasks, _) = manager(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();

        for _ in 0..6 {
            let (running, peak) = (running.clone(), peak.clone());
            ids.push(tasks.submit("test", "Test.pool", None, move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            }));
        }
        for id in &ids {
            tasks.wait(id, WAIT).await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);

        tasks.set_pool_size(4).unwrap();
        assert_eq!(tasks.pool_size(), 4);
        assert!(tasks.set_pool_size(0).is_err());
    }
}
