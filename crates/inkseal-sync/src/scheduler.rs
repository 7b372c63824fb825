//! BackgroundTaskScheduler: bounded FIFO execution of pipeline runs.
//!
//! Architecture:
//!   - `submit` records the task as pending and queues it (unbounded mpsc)
//!   - one dispatcher pops the queue in order and takes a permit from a fair
//!     `Semaphore` before spawning, so at most `max_concurrent` tasks process
//!   - each task owns a `watch` channel with its latest state (used for joins)
//!     and a child of the scheduler's shutdown token
//!   - state changes fan out on a `broadcast` channel; progress events are
//!     throttled per task, completion and terminal events are not

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use inkseal_core::config::SchedulerConfig;
use inkseal_core::{TaskId, TaskStatus};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::progress::{progress_channel, ProgressReceiver, ProgressSender, ProgressThrottle};

const EVENT_CAPACITY: usize = 256;

/// Work the scheduler knows how to run.
pub trait TaskRunner: Send + Sync + 'static {
    type Params: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Run one task to completion. Implementations should stop early once
    /// `cancel` fires and may report progress on `progress`.
    fn run(
        &self,
        params: Self::Params,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> impl Future<Output = SyncResult<Self::Output>> + Send;
}

/// Observable state of one submitted task.
#[derive(Debug, Clone)]
pub struct EncryptionTask<O> {
    pub id: TaskId,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: u8,
    pub result: Option<O>,
    pub error: Option<String>,
}

impl<O> EncryptionTask<O> {
    fn pending(id: TaskId) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
        }
    }

    fn event(&self) -> TaskEvent {
        TaskEvent {
            id: self.id,
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// Broadcast on every status change and on throttled progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedTask<O> {
    pub id: TaskId,
    pub output: O,
}

struct TaskEntry<O> {
    state: watch::Sender<EncryptionTask<O>>,
    cancel: CancellationToken,
}

struct Shared<R: TaskRunner> {
    runner: Arc<R>,
    tasks: Mutex<HashMap<TaskId, TaskEntry<R::Output>>>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
    progress_interval: Duration,
}

impl<R: TaskRunner> Shared<R> {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry<R::Output>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `update` if the task exists and `status` is a legal next state.
    fn transition(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: impl FnOnce(&mut EncryptionTask<R::Output>),
    ) -> bool {
        let tasks = self.tasks();
        let Some(entry) = tasks.get(&id) else {
            return false;
        };
        let mut event = None;
        entry.state.send_if_modified(|task| {
            if !task.status.can_transition_to(status) {
                return false;
            }
            task.status = status;
            update(task);
            event = Some(task.event());
            true
        });
        match event {
            Some(event) => {
                let _ = self.events.send(event);
                true
            }
            None => false,
        }
    }

    /// Pending -> processing. Returns the task's token, or `None` if it was
    /// cancelled while queued.
    fn begin(&self, id: TaskId) -> Option<CancellationToken> {
        if !self.transition(id, TaskStatus::Processing, |_| {}) {
            return None;
        }
        self.tasks().get(&id).map(|e| e.cancel.clone())
    }

    fn mark_cancelled(&self, id: TaskId) -> bool {
        self.transition(id, TaskStatus::Cancelled, |_| {})
    }

    async fn execute(self: Arc<Self>, id: TaskId, params: R::Params, cancel: CancellationToken) {
        let (tx, rx) = progress_channel();
        let forwarder = tokio::spawn(Arc::clone(&self).forward_progress(id, rx));

        debug!(task = id, "task started");
        let result = self.runner.run(params, cancel.clone(), tx).await;
        // The sender is gone with the runner's future; let queued updates land first.
        let _ = forwarder.await;

        match result {
            Ok(output) => {
                self.transition(id, TaskStatus::Completed, |task| {
                    task.progress = 100;
                    task.result = Some(output);
                });
                debug!(task = id, "task completed");
            }
            Err(e) if cancel.is_cancelled() => {
                self.transition(id, TaskStatus::Cancelled, |task| {
                    task.error = Some(e.to_string());
                });
                debug!(task = id, "task cancelled");
            }
            Err(e) => {
                warn!(task = id, error = %e, "task failed");
                self.transition(id, TaskStatus::Failed, |task| {
                    task.error = Some(e.to_string());
                });
            }
        }
    }

    async fn forward_progress(self: Arc<Self>, id: TaskId, mut rx: ProgressReceiver) {
        let mut throttle = ProgressThrottle::new(self.progress_interval);
        while let Some(update) = rx.recv().await {
            if let Some(event) = self.record_progress(id, update.percent, &mut throttle) {
                let _ = self.events.send(event);
            }
        }
    }

    /// Store monotonic progress; returns an event when the throttle allows one.
    fn record_progress(
        &self,
        id: TaskId,
        percent: u8,
        throttle: &mut ProgressThrottle,
    ) -> Option<TaskEvent> {
        let tasks = self.tasks();
        let entry = tasks.get(&id)?;
        let mut event = None;
        entry.state.send_if_modified(|task| {
            if task.status != TaskStatus::Processing || percent <= task.progress {
                return false;
            }
            task.progress = percent;
            if throttle.should_emit(percent) {
                event = Some(task.event());
            }
            true
        });
        event
    }
}

type Job<P> = (TaskId, P);

pub struct BackgroundTaskScheduler<R: TaskRunner> {
    shared: Arc<Shared<R>>,
    queue: mpsc::UnboundedSender<Job<R::Params>>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<R: TaskRunner> BackgroundTaskScheduler<R> {
    /// Must be called from within a Tokio runtime.
    pub fn new(runner: Arc<R>, config: &SchedulerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            runner,
            tasks: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        });

        let (queue, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), rx, semaphore));
        info!(max_concurrent, "task scheduler ready");

        Self {
            shared,
            queue,
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Queue a task and return its id immediately. After shutdown the task
    /// is recorded as cancelled and never runs.
    pub fn submit(&self, params: R::Params) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(EncryptionTask::pending(id));
        self.shared.tasks().insert(
            id,
            TaskEntry {
                state,
                cancel: self.shared.shutdown.child_token(),
            },
        );
        let _ = self.shared.events.send(EncryptionTask::<R::Output>::pending(id).event());

        if self.shared.shutdown.is_cancelled() || self.queue.send((id, params)).is_err() {
            debug!(task = id, "submitted after shutdown");
            self.shared.mark_cancelled(id);
        } else {
            debug!(task = id, "task queued");
        }
        id
    }

    /// Cancel a pending or processing task. Returns `false` if the task is
    /// unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let status = {
            let tasks = self.shared.tasks();
            let Some(entry) = tasks.get(&id) else {
                return false;
            };
            let status = entry.state.borrow().status;
            if status.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            status
        };
        if status == TaskStatus::Pending {
            self.shared.mark_cancelled(id);
        }
        debug!(task = id, %status, "cancel requested");
        true
    }

    pub fn status(&self, id: TaskId) -> Option<EncryptionTask<R::Output>> {
        self.shared
            .tasks()
            .get(&id)
            .map(|e| e.state.borrow().clone())
    }

    /// Every known task, ordered by id.
    pub fn snapshot(&self) -> Vec<EncryptionTask<R::Output>> {
        let mut all: Vec<_> = self
            .shared
            .tasks()
            .values()
            .map(|e| e.state.borrow().clone())
            .collect();
        all.sort_by_key(|t| t.id);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until every listed task is terminal and return the ones that
    /// completed, in the order given. Unknown ids are skipped.
    pub async fn wait_for_tasks(&self, ids: &[TaskId]) -> Vec<CompletedTask<R::Output>> {
        let receivers: Vec<_> = {
            let tasks = self.shared.tasks();
            ids.iter()
                .filter_map(|id| tasks.get(id).map(|e| (*id, e.state.subscribe())))
                .collect()
        };

        let mut completed = Vec::new();
        for (id, mut rx) in receivers {
            let outcome = rx
                .wait_for(|t| t.status.is_terminal())
                .await
                .map(|t| (t.status, t.result.clone()));
            if let Ok((TaskStatus::Completed, Some(output))) = outcome {
                completed.push(CompletedTask { id, output });
            }
        }
        completed
    }

    pub async fn wait_for_all(&self) -> Vec<CompletedTask<R::Output>> {
        let mut ids: Vec<TaskId> = self.shared.tasks().keys().copied().collect();
        ids.sort_unstable();
        self.wait_for_tasks(&ids).await
    }

    /// Cancel everything outstanding and wait for running tasks to stop.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let pending: Vec<TaskId> = self
            .shared
            .tasks()
            .iter()
            .filter(|(_, e)| e.state.borrow().status == TaskStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        for id in &pending {
            self.shared.mark_cancelled(*id);
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        let completed = self.wait_for_all().await;
        info!(
            cancelled_pending = pending.len(),
            completed = completed.len(),
            "task scheduler shut down"
        );
    }

    /// Forget terminal tasks. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = self.shared.tasks();
        let before = tasks.len();
        tasks.retain(|_, e| !e.state.borrow().status.is_terminal());
        before - tasks.len()
    }
}

async fn dispatch<R: TaskRunner>(
    shared: Arc<Shared<R>>,
    mut rx: mpsc::UnboundedReceiver<Job<R::Params>>,
    semaphore: Arc<Semaphore>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            job = rx.recv() => job,
        };
        let Some((id, params)) = job else {
            break;
        };

        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(cancel) = shared.begin(id) else {
            debug!(task = id, "skipping task cancelled while queued");
            continue;
        };

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            task_shared.execute(id, params, cancel).await;
        });
    }
    debug!("task dispatcher stopped");
}
