//! Named OS threads that share a cancellation flag and fail together

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, TrackerError};

/// Cooperative cancellation flag checked by long-running loops
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type StopAction = Box<dyn FnOnce() + Send>;

struct FaultState {
    name: String,
    token: CancelToken,
    stop_action: Mutex<Option<StopAction>>,
    errors: Mutex<Vec<TrackerError>>,
}

impl FaultState {
    fn fault(&self, task: &str, err: TrackerError) {
        error!(group = %self.name, task, error = %err, "Task failed, stopping group");
        self.errors.lock().push(err);
        self.token.cancel();
        // Taken under the lock so the action runs once no matter how many tasks fail
        let action = self.stop_action.lock().take();
        if let Some(action) = action {
            action();
        }
    }
}

/// A group of threads started together.
///
/// The first task to return an error or panic cancels the shared token
/// and runs the group's stop action exactly once. `join` waits for every
/// thread and then re-raises the captured faults, aggregated when there
/// is more than one.
pub struct TaskGroup {
    state: Arc<FaultState>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(FaultState {
                name: name.into(),
                token: CancelToken::new(),
                stop_action: Mutex::new(None),
                errors: Mutex::new(Vec::new()),
            }),
            handles: Vec::new(),
        }
    }

    /// Action run on the first fault, in addition to cancelling the token
    pub fn on_fault(&self, action: impl FnOnce() + Send + 'static) {
        *self.state.stop_action.lock() = Some(Box::new(action));
    }

    pub fn token(&self) -> CancelToken {
        self.state.token.clone()
    }

    pub fn spawn<F>(&mut self, task: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce(CancelToken) -> Result<()> + Send + 'static,
    {
        let task = task.into();
        let state = self.state.clone();
        let thread_task = task.clone();
        let handle = thread::Builder::new().name(task.clone()).spawn(move || {
            let token = state.token.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| f(token))) {
                Ok(Ok(())) => debug!(group = %state.name, task = %thread_task, "Task finished"),
                Ok(Err(err)) => state.fault(&thread_task, err),
                Err(_) => {
                    state.fault(&thread_task, TrackerError::WorkerPanicked(thread_task.clone()))
                }
            }
        })?;
        self.handles.push((task, handle));
        Ok(())
    }

    pub fn cancel(&self) {
        self.state.token.cancel();
    }

    pub fn has_faulted(&self) -> bool {
        !self.state.errors.lock().is_empty()
    }

    /// True once every spawned thread has returned
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|(_, handle)| handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn join(self) -> Result<()> {
        for (task, handle) in self.handles {
            if handle.join().is_err() {
                self.state.errors.lock().push(TrackerError::WorkerPanicked(task));
            }
        }
        let errors = std::mem::take(&mut *self.state.errors.lock());
        TrackerError::combine(errors)
    }
}
