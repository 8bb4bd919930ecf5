//! Tasks, handles and continuations

use manifold_core::ManifoldError;
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;

use crate::reactor::Reactor;

/// Error delivered to a continuation's error path
pub type TaskError = ManifoldError;

/// Unit of work run on the scheduling thread
pub type Job = Box<dyn FnOnce(&Reactor)>;

/// Identifier of a logical task, shared by the continuations it yields to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// Lifecycle of a logical task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Enqueued, not yet run
    Ready,
    /// Executing on the scheduling thread
    Running,
    /// Yielded, waiting for a continuation to run
    Suspended,
    /// Completed or errored
    Done,
}

/// Integer handle of a deferred continuation expecting a `T`.
pub struct TaskHandle<T> {
    id: u64,
    _marker: PhantomData<fn(T)>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Rebuild a handle from its integer form, e.g. after it crossed a message.
    pub fn from_raw(id: u64) -> Self {
        Self::new(id)
    }

    pub fn raw(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaskHandle<T> {}

impl<T> PartialEq for TaskHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for TaskHandle<T> {}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({})", self.id)
    }
}

/// Receiver of a task's outcome. Both callbacks run on the scheduling thread,
/// never concurrently with other task code.
pub trait TaskListener<T> {
    fn task_finished(&mut self, value: T, reactor: &Reactor);

    fn task_error(&mut self, err: TaskError, reactor: &Reactor);
}

/// Listener built from a pair of closures.
pub struct Continuation<F, E> {
    on_finished: F,
    on_error: E,
}

impl<T, F, E> TaskListener<T> for Continuation<F, E>
where
    F: FnMut(T, &Reactor),
    E: FnMut(TaskError, &Reactor),
{
    fn task_finished(&mut self, value: T, reactor: &Reactor) {
        (self.on_finished)(value, reactor)
    }

    fn task_error(&mut self, err: TaskError, reactor: &Reactor) {
        (self.on_error)(err, reactor)
    }
}

pub fn continuation<T, F, E>(on_finished: F, on_error: E) -> Continuation<F, E>
where
    F: FnMut(T, &Reactor),
    E: FnMut(TaskError, &Reactor),
{
    Continuation {
        on_finished,
        on_error,
    }
}

fn log_task_error(err: TaskError, reactor: &Reactor) {
    warn!("Unhandled task error on {}: {}", reactor.node(), err);
}

/// Listener whose error path only logs.
pub fn on_finished<T, F>(on_finished: F) -> Continuation<F, fn(TaskError, &Reactor)>
where
    F: FnMut(T, &Reactor),
{
    Continuation {
        on_finished,
        on_error: log_task_error,
    }
}

/// Listener receiving either outcome as a `Result`.
pub fn on_result<T, F>(f: F) -> ResultListener<F>
where
    F: FnMut(Result<T, TaskError>, &Reactor),
{
    ResultListener(f)
}

pub struct ResultListener<F>(F);

impl<T, F> TaskListener<T> for ResultListener<F>
where
    F: FnMut(Result<T, TaskError>, &Reactor),
{
    fn task_finished(&mut self, value: T, reactor: &Reactor) {
        (self.0)(Ok(value), reactor)
    }

    fn task_error(&mut self, err: TaskError, reactor: &Reactor) {
        (self.0)(Err(err), reactor)
    }
}
