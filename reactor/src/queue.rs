//! Ready queue and deferred continuations

use manifold_core::{ManifoldError, ManifoldResult};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::reactor::Reactor;
use crate::task::{Job, TaskError, TaskHandle, TaskId, TaskListener, TaskState};

type Resume = Box<dyn FnOnce(Result<Box<dyn Any>, TaskError>, &Reactor)>;

pub(crate) struct ReadyEntry {
    pub(crate) task: TaskId,
    pub(crate) job: Job,
    /// Resumes a task that yielded, rather than starting one
    continuation: bool,
}

struct TaskRecord {
    state: TaskState,
    /// Continuations queued or deferred on behalf of this task
    outstanding: usize,
}

struct Deferred {
    owner: Option<TaskId>,
    resume: Resume,
}

/// Handles are issued in sequence, so an id below the next one to issue was
/// issued and has already been completed.
fn missing_handle(id: u64, next_handle: u64) -> ManifoldError {
    if id < next_handle {
        ManifoldError::DoubleComplete(id)
    } else {
        ManifoldError::UnknownHandle(id)
    }
}

/// Scheduler state for one reactor: FIFO ready tasks plus continuations
/// registered under integer handles.
#[derive(Default)]
pub struct TaskQueue {
    ready: VecDeque<ReadyEntry>,
    tasks: HashMap<TaskId, TaskRecord>,
    next_task: u64,
    current: Option<TaskId>,
    deferred: HashMap<u64, Deferred>,
    next_handle: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_task(&mut self) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        self.tasks.insert(
            id,
            TaskRecord {
                state: TaskState::Ready,
                outstanding: 0,
            },
        );
        id
    }

    /// Queue a new task behind every task already ready.
    pub fn enqueue(&mut self, job: Job) -> TaskId {
        let task = self.new_task();
        self.ready.push_back(ReadyEntry {
            task,
            job,
            continuation: false,
        });
        task
    }

    /// Queue a continuation of the running task. Outside any task the
    /// continuation starts a task of its own.
    pub(crate) fn push_continuation(&mut self, job: Job) -> TaskId {
        match self.current {
            Some(task) => {
                if let Some(record) = self.tasks.get_mut(&task) {
                    record.outstanding += 1;
                }
                self.ready.push_back(ReadyEntry {
                    task,
                    job,
                    continuation: true,
                });
                task
            }
            None => self.enqueue(job),
        }
    }

    /// Register `listener` under a fresh handle. Nothing is suspended.
    pub fn defer<T, L>(&mut self, listener: L) -> TaskHandle<T>
    where
        T: 'static,
        L: TaskListener<T> + 'static,
    {
        let id = self.next_handle;
        self.next_handle += 1;

        let mut listener = listener;
        let resume: Resume = Box::new(move |result, reactor| match result {
            Ok(value) => match value.downcast::<T>() {
                Ok(value) => listener.task_finished(*value, reactor),
                Err(_) => listener.task_error(
                    ManifoldError::InvalidState(format!("value type mismatch for task handle {}", id)),
                    reactor,
                ),
            },
            Err(err) => listener.task_error(err, reactor),
        });
        self.deferred.insert(id, Deferred { owner: None, resume });
        TaskHandle::new(id)
    }

    /// Suspend the running task until `handle` is completed.
    pub fn suspend_on<T>(&mut self, handle: TaskHandle<T>) -> ManifoldResult<()> {
        let id = handle.raw();
        let current = self.current;
        let deferred = match self.deferred.get_mut(&id) {
            Some(deferred) => deferred,
            None => return Err(missing_handle(id, self.next_handle)),
        };
        if let Some(task) = current {
            if deferred.owner.is_none() {
                deferred.owner = Some(task);
                if let Some(record) = self.tasks.get_mut(&task) {
                    record.outstanding += 1;
                }
            }
        }
        Ok(())
    }

    /// Schedule the continuation under `id` to resume with `value`. It runs
    /// on a later turn, after the current task returns.
    pub fn complete_raw(&mut self, id: u64, value: Result<Box<dyn Any>, TaskError>) -> ManifoldResult<()> {
        let deferred = match self.deferred.remove(&id) {
            Some(deferred) => deferred,
            None => return Err(missing_handle(id, self.next_handle)),
        };
        let (task, continuation) = match deferred.owner {
            Some(task) => (task, true),
            None => (self.new_task(), false),
        };
        let resume = deferred.resume;
        self.ready.push_back(ReadyEntry {
            task,
            job: Box::new(move |reactor| resume(value, reactor)),
            continuation,
        });
        debug!("Completed task handle {} on behalf of {}", id, task);
        Ok(())
    }

    pub fn complete<T: 'static>(&mut self, handle: TaskHandle<T>, value: T) -> ManifoldResult<()> {
        self.complete_raw(handle.raw(), Ok(Box::new(value)))
    }

    /// Complete `handle` through its listener's error path.
    pub fn fail<T>(&mut self, handle: TaskHandle<T>, err: TaskError) -> ManifoldResult<()> {
        self.complete_raw(handle.raw(), Err(err))
    }

    pub(crate) fn next_ready(&mut self) -> Option<ReadyEntry> {
        let entry = self.ready.pop_front()?;
        let record = self.tasks.entry(entry.task).or_insert(TaskRecord {
            state: TaskState::Ready,
            outstanding: 0,
        });
        if entry.continuation {
            record.outstanding = record.outstanding.saturating_sub(1);
        }
        record.state = TaskState::Running;
        self.current = Some(entry.task);
        Some(entry)
    }

    pub(crate) fn finish_current(&mut self) {
        let Some(task) = self.current.take() else {
            return;
        };
        let suspended = match self.tasks.get_mut(&task) {
            Some(record) if record.outstanding > 0 => {
                record.state = TaskState::Suspended;
                true
            }
            _ => false,
        };
        if !suspended {
            self.tasks.remove(&task);
        }
    }

    /// State of `task`; `None` if it was never enqueued.
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        match self.tasks.get(&task) {
            Some(record) => Some(record.state),
            None if task.0 < self.next_task => Some(TaskState::Done),
            None => None,
        }
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    /// Deferred continuations not yet completed.
    pub fn pending_handles(&self) -> usize {
        self.deferred.len()
    }
}
