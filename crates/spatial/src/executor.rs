//! # Transactional Executor Boundary
//!
//! The spatial core hands work to the outside world only through
//! [`TransactionExecutor`]. Tasks scheduled under the same [`QueueOwner`]
//! run strictly in submission order; tasks under different owners, and
//! unqueued tasks, may interleave freely.
//!
//! [`LocalExecutor`] is the in-process implementation used by the server
//! binary and by tests.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{SpatialError, SpatialResult};
use crate::types::{CellId, Identity};

/// A unit of work run inside a transaction.
pub trait TransactionalTask: Send + 'static {
    /// Short label used in logs and rejection errors
    fn name(&self) -> &str;

    fn run(self: Box<Self>) -> SpatialResult<()>;
}

/// Wrap a closure as a task
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: FnOnce() -> SpatialResult<()> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> TransactionalTask for FnTask<F>
where
    F: FnOnce() -> SpatialResult<()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>) -> SpatialResult<()> {
        (self.f)()
    }
}

/// Key of an ordered task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOwner {
    /// All deltas of one view
    View(CellId),
    /// A single delta
    Update(u64),
    /// Caller-defined queue
    Custom(u64),
}

impl fmt::Display for QueueOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOwner::View(view) => write!(f, "view:{}", view),
            QueueOwner::Update(seq) => write!(f, "update:{}", seq),
            QueueOwner::Custom(id) => write!(f, "custom:{}", id),
        }
    }
}

/// Scheduler the spatial core submits transactional work to.
pub trait TransactionExecutor: Send + Sync {
    /// Run `task` as `identity` with no ordering guarantee
    fn schedule(&self, task: Box<dyn TransactionalTask>, identity: &Identity) -> SpatialResult<()>;

    /// Run `task` as `identity` after every task previously queued under
    /// `owner`
    fn schedule_queued(
        &self,
        task: Box<dyn TransactionalTask>,
        identity: &Identity,
        owner: QueueOwner,
    ) -> SpatialResult<()>;

    /// Release the queue for `owner` once its pending tasks have run
    fn delete_queue(&self, owner: QueueOwner);
}

// ============================================================================
// Local Executor
// ============================================================================

struct Job {
    task: Box<dyn TransactionalTask>,
    identity: Identity,
}

enum Ready {
    Unqueued(Job),
    /// The head of this owner's queue may run
    Owner(QueueOwner),
}

#[derive(Default)]
struct OwnerQueue {
    tasks: VecDeque<Job>,
    running: bool,
    retired: bool,
}

#[derive(Default)]
struct ExecutorState {
    ready: VecDeque<Ready>,
    queues: HashMap<QueueOwner, OwnerQueue>,
    pending: usize,
}

/// Executor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub pending: usize,
    pub queues: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Bounded in-process executor.
///
/// An owner has at most one task running at a time. Tasks are only run by
/// [`run_pending`](Self::run_pending), either directly or from the tokio
/// runner started with [`spawn_runner`](Self::spawn_runner).
pub struct LocalExecutor {
    capacity: usize,
    state: Mutex<ExecutorState>,
    notify: Notify,
    shutdown: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl LocalExecutor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ExecutorState::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn admit(&self, state: &ExecutorState, task: &dyn TransactionalTask) -> SpatialResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SpatialError::rejected(task.name(), "executor shut down"));
        }
        if state.pending >= self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SpatialError::rejected(
                task.name(),
                format!("queue full ({} pending)", state.pending),
            ));
        }
        Ok(())
    }

    /// Pop the next runnable job, marking its owner busy
    fn next_job(&self) -> Option<(Job, Option<QueueOwner>)> {
        let mut state = self.state.lock();
        loop {
            match state.ready.pop_front()? {
                Ready::Unqueued(job) => {
                    state.pending -= 1;
                    return Some((job, None));
                }
                Ready::Owner(owner) => {
                    let Some(queue) = state.queues.get_mut(&owner) else {
                        continue;
                    };
                    let Some(job) = queue.tasks.pop_front() else {
                        continue;
                    };
                    queue.running = true;
                    state.pending -= 1;
                    return Some((job, Some(owner)));
                }
            }
        }
    }

    fn finish(&self, owner: QueueOwner) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(&owner) else {
            return;
        };
        queue.running = false;
        if !queue.tasks.is_empty() {
            state.ready.push_back(Ready::Owner(owner));
        } else if queue.retired {
            state.queues.remove(&owner);
            trace!(%owner, "Retired task queue");
        }
    }

    /// Run tasks until nothing is runnable. Tasks scheduled by running
    /// tasks are picked up in the same call. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some((job, owner)) = self.next_job() {
            let name = job.task.name().to_string();
            match job.task.run() {
                Ok(()) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(task = %name, identity = %job.identity, error = %e, "Transactional task failed");
                }
            }
            if let Some(owner) = owner {
                self.finish(owner);
            }
            ran += 1;
        }
        ran
    }

    /// Drive the executor from a tokio task until `shutdown` fires.
    pub fn spawn_runner(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Executor runner started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = executor.notify.notified() => {
                        let worker = Arc::clone(&executor);
                        match tokio::task::spawn_blocking(move || worker.run_pending()).await {
                            Ok(ran) => trace!(ran, "Executor pass complete"),
                            Err(e) => error!(error = %e, "Executor pass panicked"),
                        }
                    }
                }
            }
            debug!("Executor runner stopped");
        })
    }

    /// Reject all further work. Already accepted tasks stay runnable.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn has_queue(&self, owner: QueueOwner) -> bool {
        self.state.lock().queues.contains_key(&owner)
    }

    pub fn stats(&self) -> ExecutorStats {
        let state = self.state.lock();
        ExecutorStats {
            pending: state.pending,
            queues: state.queues.len(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl TransactionExecutor for LocalExecutor {
    fn schedule(&self, task: Box<dyn TransactionalTask>, identity: &Identity) -> SpatialResult<()> {
        {
            let mut state = self.state.lock();
            self.admit(&state, task.as_ref())?;
            state.pending += 1;
            state.ready.push_back(Ready::Unqueued(Job {
                task,
                identity: identity.clone(),
            }));
        }
        self.notify.notify_one();
        Ok(())
    }

    fn schedule_queued(
        &self,
        task: Box<dyn TransactionalTask>,
        identity: &Identity,
        owner: QueueOwner,
    ) -> SpatialResult<()> {
        {
            let mut state = self.state.lock();
            self.admit(&state, task.as_ref())?;
            state.pending += 1;

            let queue = state.queues.entry(owner).or_default();
            let idle = !queue.running && queue.tasks.is_empty();
            queue.tasks.push_back(Job {
                task,
                identity: identity.clone(),
            });
            if idle {
                state.ready.push_back(Ready::Owner(owner));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    fn delete_queue(&self, owner: QueueOwner) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(&owner) else {
            return;
        };
        if queue.running || !queue.tasks.is_empty() {
            queue.retired = true;
        } else {
            state.queues.remove(&owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn TransactionalTask>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &str| -> Box<dyn TransactionalTask> {
            let sink = Arc::clone(&sink);
            let label = label.to_string();
            Box::new(FnTask::new(label.clone(), move || {
                sink.lock().push(label);
                Ok(())
            }))
        };
        (log, make)
    }

    #[test]
    fn test_per_owner_fifo() {
        let executor = LocalExecutor::new(16);
        let (log, task) = recorder();
        let id = Identity::system();
        let a = QueueOwner::View(CellId::new(1));
        let b = QueueOwner::View(CellId::new(2));

        executor.schedule_queued(task("a1"), &id, a).unwrap();
        executor.schedule_queued(task("b1"), &id, b).unwrap();
        executor.schedule_queued(task("a2"), &id, a).unwrap();
        executor.schedule_queued(task("a3"), &id, a).unwrap();
        executor.schedule_queued(task("b2"), &id, b).unwrap();

        assert_eq!(executor.run_pending(), 5);

        let log = log.lock();
        let of = |prefix: char| -> Vec<&String> {
            log.iter().filter(|l| l.starts_with(prefix)).collect()
        };
        assert_eq!(of('a'), vec!["a1", "a2", "a3"]);
        assert_eq!(of('b'), vec!["b1", "b2"]);
    }

    #[test]
    fn test_capacity_rejection() {
        let executor = LocalExecutor::new(2);
        let (_log, task) = recorder();
        let id = Identity::system();

        executor.schedule(task("one"), &id).unwrap();
        executor.schedule(task("two"), &id).unwrap();
        let err = executor.schedule(task("three"), &id).unwrap_err();

        assert!(matches!(err, SpatialError::TaskRejected { .. }));
        assert!(err.is_benign());
        assert_eq!(executor.stats().rejected, 1);

        executor.run_pending();
        assert!(executor.schedule(task("four"), &id).is_ok());
    }

    #[test]
    fn test_delete_queue_after_drain() {
        let executor = LocalExecutor::new(8);
        let (log, task) = recorder();
        let id = Identity::system();
        let owner = QueueOwner::Update(7);

        executor.schedule_queued(task("x"), &id, owner).unwrap();
        executor.delete_queue(owner);
        // Pending work survives deletion
        assert!(executor.has_queue(owner));

        executor.run_pending();
        assert_eq!(log.lock().as_slice(), ["x"]);
        assert!(!executor.has_queue(owner));
    }

    #[test]
    fn test_tasks_scheduled_while_running() {
        let executor = Arc::new(LocalExecutor::new(8));
        let (log, task) = recorder();
        let id = Identity::system();

        let inner = Arc::clone(&executor);
        let follow_up = task("follow-up");
        executor
            .schedule(
                Box::new(FnTask::new("outer", move || {
                    inner.schedule(follow_up, &Identity::system())
                })),
                &id,
            )
            .unwrap();

        assert_eq!(executor.run_pending(), 2);
        assert_eq!(log.lock().as_slice(), ["follow-up"]);
    }

    #[test]
    fn test_failed_task_counted() {
        let executor = LocalExecutor::new(4);
        executor
            .schedule(
                Box::new(FnTask::new("broken", || Err(SpatialError::TaskFailed("boom".into())))),
                &Identity::system(),
            )
            .unwrap();

        executor.run_pending();
        assert_eq!(executor.stats().failed, 1);
    }

    #[test]
    fn test_shutdown_rejects() {
        let executor = LocalExecutor::new(4);
        let (_log, task) = recorder();
        executor.shutdown();

        assert!(executor.schedule(task("late"), &Identity::system()).is_err());
        assert!(executor.is_shutdown());
    }

    #[tokio::test]
    async fn test_runner_drains() {
        let executor = Arc::new(LocalExecutor::new(8));
        let (log, task) = recorder();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = executor.spawn_runner(shutdown_rx);

        executor.schedule(task("async"), &Identity::system()).unwrap();

        for _ in 0..50 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(log.lock().as_slice(), ["async"]);

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }
}
