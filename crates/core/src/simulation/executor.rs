//! Single-threaded executor for simulated scripts.
//!
//! Tasks are plain `!Send` futures. Their wakers do nothing but push the
//! task id onto a FIFO ready-queue, so the order in which tasks run is
//! fully determined by the order in which they were woken.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    task::Waker,
};

use futures::{
    future::LocalBoxFuture,
    task::{waker, ArcWake},
};

use super::process::ProcessId;

/// Unique identifier for a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Default)]
struct ReadyState {
    queue: VecDeque<TaskId>,
    queued: HashSet<TaskId>,
}

/// FIFO of runnable tasks. A task is queued at most once at a time.
#[derive(Clone, Default)]
pub(crate) struct ReadyQueue {
    inner: Arc<Mutex<ReadyState>>,
}

impl ReadyQueue {
    fn lock(&self) -> MutexGuard<'_, ReadyState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, id: TaskId) {
        let mut state = self.lock();
        if state.queued.insert(id) {
            state.queue.push_back(id);
        }
    }

    pub fn pop(&self) -> Option<TaskId> {
        let mut state = self.lock();
        let id = state.queue.pop_front()?;
        state.queued.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}

struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.push(arc_self.id);
    }
}

struct Task {
    process: ProcessId,
    future: LocalBoxFuture<'static, ()>,
}

/// A task taken out of the executor for polling.
pub(crate) struct Runnable {
    pub id: TaskId,
    pub process: ProcessId,
    pub future: LocalBoxFuture<'static, ()>,
    pub waker: Waker,
}

#[derive(Default)]
pub(crate) struct Executor {
    tasks: BTreeMap<TaskId, Task>,
    ready: ReadyQueue,
    next_id: u64,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task and makes it runnable.
    pub fn spawn(&mut self, process: ProcessId, future: LocalBoxFuture<'static, ()>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, Task { process, future });
        self.ready.push(id);
        id
    }

    /// Takes the next runnable task out of the table.
    ///
    /// Ids of tasks that no longer exist are skipped.
    pub fn next_runnable(&mut self) -> Option<Runnable> {
        while let Some(id) = self.ready.pop() {
            if let Some(task) = self.tasks.remove(&id) {
                let waker = waker(Arc::new(TaskWaker {
                    id,
                    ready: self.ready.clone(),
                }));
                return Some(Runnable {
                    id,
                    process: task.process,
                    future: task.future,
                    waker,
                });
            }
        }
        None
    }

    /// Returns a task that is still pending after a poll.
    pub fn put_back(&mut self, runnable: Runnable) {
        self.tasks.insert(
            runnable.id,
            Task {
                process: runnable.process,
                future: runnable.future,
            },
        );
    }

    #[cfg(test)]
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    #[cfg(test)]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Removes every task of `process`. The futures are returned so the
    /// caller can drop them once it no longer borrows the executor.
    #[must_use]
    pub fn remove_process(&mut self, process: ProcessId) -> Vec<LocalBoxFuture<'static, ()>> {
        let ids: Vec<_> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.process == process)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .map(|task| task.future)
            .collect()
    }

    /// Removes every task.
    #[must_use]
    pub fn drain(&mut self) -> Vec<LocalBoxFuture<'static, ()>> {
        std::mem::take(&mut self.tasks)
            .into_values()
            .map(|task| task.future)
            .collect()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}
