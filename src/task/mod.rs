//! Cancellable, timeout-capable handle over a single asynchronous result.
//!
//! A [`Task`] is resolved exactly once, either through its [`Completer`], by
//! [`Task::cancel`], or by a timeout armed with [`Task::set_timeout`]. Once
//! resolved it is terminal. Callbacks registered after resolution run
//! immediately, so registration order relative to completion never loses a
//! signal.

use std::{collections::HashSet, future::Future, sync::Arc, thread::ThreadId, time::Duration};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tokio::{runtime::Handle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::common::guarded;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task timed out")]
    TimedOut,
    #[error("blocking on a task from a gateway thread would stall the session")]
    BlockingOnGatewayThread,
    #[error("{0}")]
    Failed(String),
}

/// Threads that pump a gateway socket. Blocking waits are refused on them.
#[derive(Debug, Default)]
pub struct GatewayThreads {
    ids: RwLock<HashSet<ThreadId>>,
}

impl GatewayThreads {
    pub fn register_current(&self) -> ThreadId {
        let id = std::thread::current().id();
        self.ids.write().insert(id);
        id
    }

    pub fn unregister(&self, id: ThreadId) {
        self.ids.write().remove(&id);
    }

    pub fn is_current(&self) -> bool {
        self.ids.read().contains(&std::thread::current().id())
    }
}

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&TaskError) + Send>;

enum State<T> {
    Pending {
        on_success: Vec<SuccessCallback<T>>,
        on_error: Vec<ErrorCallback>,
    },
    Done(Arc<Result<T, TaskError>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
    /// Observed by the underlying operation; fired on cancel and timeout.
    cancel: CancellationToken,
    /// Fired on any terminal transition; stops timeout watchers.
    settled: CancellationToken,
    threads: Arc<GatewayThreads>,
    runtime: Handle,
}

impl<T> Inner<T> {
    fn finish(&self, result: Result<T, TaskError>) -> bool {
        let (on_success, on_error, done) = {
            let mut state = self.state.lock();
            let State::Pending {
                on_success,
                on_error,
            } = &mut *state
            else {
                return false;
            };
            let on_success = std::mem::take(on_success);
            let on_error = std::mem::take(on_error);
            let done = Arc::new(result);
            *state = State::Done(Arc::clone(&done));
            (on_success, on_error, done)
        };

        self.resolved.notify_all();
        self.settled.cancel();

        match done.as_ref() {
            Ok(value) => {
                for callback in on_success {
                    guarded("task.on_success", || callback(value));
                }
            }
            Err(err) => {
                for callback in on_error {
                    guarded("task.on_error", || callback(err));
                }
            }
        }
        true
    }

    fn result(&self) -> Option<Arc<Result<T, TaskError>>> {
        match &*self.state.lock() {
            State::Done(result) => Some(Arc::clone(result)),
            State::Pending { .. } => None,
        }
    }
}

pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.result() {
            None => "pending",
            Some(r) if r.is_ok() => "succeeded",
            Some(_) => "failed",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

/// Write side of a pending [`Task`]. Dropping it unresolved fails the task.
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Completer<T> {
    /// Returns `false` when the task was already terminal.
    pub fn complete(self, result: Result<T, TaskError>) -> bool {
        self.inner.finish(result)
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.result().is_some()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.inner.finish(Err(TaskError::Failed(
            "operation ended without a result".into(),
        )));
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    pub fn pending(runtime: Handle, threads: Arc<GatewayThreads>) -> (Self, Completer<T>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending {
                on_success: Vec::new(),
                on_error: Vec::new(),
            }),
            resolved: Condvar::new(),
            cancel: CancellationToken::new(),
            settled: CancellationToken::new(),
            threads,
            runtime,
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Completer { inner },
        )
    }

    /// Drives `fut` on `runtime`. Cancelling the task drops the future.
    pub fn spawn<F>(runtime: &Handle, threads: Arc<GatewayThreads>, fut: F) -> Self
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let (task, completer) = Self::pending(runtime.clone(), threads);
        let cancel = completer.cancellation_token();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = fut => {
                    completer.complete(result);
                }
            }
        });
        task
    }

    pub fn on_success(&self, callback: impl FnOnce(&T) + Send + 'static) -> &Self {
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { on_success, .. } => {
                    on_success.push(Box::new(callback));
                    return self;
                }
                State::Done(result) => Arc::clone(result),
            }
        };
        if let Ok(value) = done.as_ref() {
            guarded("task.on_success", || callback(value));
        }
        self
    }

    pub fn on_error(&self, callback: impl FnOnce(&TaskError) + Send + 'static) -> &Self {
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { on_error, .. } => {
                    on_error.push(Box::new(callback));
                    return self;
                }
                State::Done(result) => Arc::clone(result),
            }
        };
        if let Err(err) = done.as_ref() {
            guarded("task.on_error", || callback(err));
        }
        self
    }

    /// Fails the task with [`TaskError::TimedOut`] if it is still pending
    /// after `timeout`, and cancels the underlying operation.
    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        let inner = Arc::clone(&self.inner);
        let deadline = Instant::now() + timeout;
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = inner.settled.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if inner.finish(Err(TaskError::TimedOut)) {
                        inner.cancel.cancel();
                    }
                }
            }
        });
        self
    }

    /// Resolves the task as cancelled and signals the underlying operation.
    /// Never blocks. Returns `false` if the task was already terminal.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.finish(Err(TaskError::Cancelled));
        if cancelled {
            self.inner.cancel.cancel();
        }
        cancelled
    }

    pub fn is_done(&self) -> bool {
        self.inner.result().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.result().as_deref(),
            Some(Err(TaskError::Cancelled))
        )
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// The failure, once the task has failed.
    pub fn error(&self) -> Option<TaskError> {
        match &*self.inner.result()? {
            Err(err) => Some(err.clone()),
            Ok(_) => None,
        }
    }

    /// Waits, without blocking the thread, until the task is terminal.
    pub async fn finished(&self) {
        self.inner.settled.cancelled().await;
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// Blocks until the task resolves.
    ///
    /// Refused on gateway threads: the awaited result may itself depend on
    /// the gateway making progress.
    pub fn get(&self) -> Result<T, TaskError> {
        if self.inner.threads.is_current() {
            return Err(TaskError::BlockingOnGatewayThread);
        }
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.as_ref().clone();
            }
            self.inner.resolved.wait(&mut state);
        }
    }

    /// Like [`Task::get`] but gives up after `timeout`, leaving the task
    /// pending.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        if self.inner.threads.is_current() {
            return Err(TaskError::BlockingOnGatewayThread);
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.as_ref().clone();
            }
            if self
                .inner
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(TaskError::TimedOut);
            }
        }
    }
}
