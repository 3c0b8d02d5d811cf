/*!
 * Delayed task scheduling.
 *
 * This module provides a one-shot delayed task scheduler. A task runs once
 * after its delay unless it is cancelled first; cancelling a task that has
 * already fired (or was already cancelled) reports that nothing was found.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Handle identifying one scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Create a handle from a raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The body of a scheduled task. It receives its own handle when it fires.
pub type ScheduledTask = Box<dyn FnOnce(TaskHandle) -> BoxFuture<'static, ()> + Send>;

/// One-shot delayed task scheduler
pub trait DelayedTaskScheduler: Send + Sync + fmt::Debug {
    /// Run `task` once after `delay`
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TaskHandle;

    /// Cancel a task that has not fired yet
    ///
    /// Returns `false` when the handle already fired or was already cancelled.
    fn cancel(&self, handle: TaskHandle) -> bool;
}

/// Delayed task scheduler backed by the tokio timer
pub struct TokioTaskScheduler {
    runtime: Handle,
    next_handle: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskHandle, JoinHandle<()>>>>,
}

impl TokioTaskScheduler {
    /// Create a scheduler that spawns onto the given runtime
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_handle: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a scheduler on the runtime of the calling context
    pub fn from_current() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::scheduler(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::new(runtime))
    }

    /// Number of tasks that have neither fired nor been cancelled
    pub fn pending_count(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Cancel every task that has not fired yet
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(_) => return 0,
        };

        for (handle, task) in &drained {
            trace!("Cancelling {}", handle);
            task.abort();
        }

        drained.len()
    }
}

impl fmt::Debug for TokioTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTaskScheduler")
            .field("next_handle", &self.next_handle)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl DelayedTaskScheduler for TokioTaskScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TaskHandle {
        let handle = TaskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let tasks = self.tasks.clone();

        // The map lock is held across the spawn so a zero-delay task cannot
        // try to deregister itself before it has been registered.
        let mut pending = match self.tasks.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };

        let join = self.runtime.spawn(async move {
            time::sleep(delay).await;

            let still_scheduled = match tasks.lock() {
                Ok(mut tasks) => tasks.remove(&handle).is_some(),
                Err(_) => false,
            };

            if still_scheduled {
                trace!("Running {}", handle);
                task(handle).await;
            }
        });

        pending.insert(handle, join);
        debug!("Scheduled {} to run in {:?}", handle, delay);
        handle
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        let removed = match self.tasks.lock() {
            Ok(mut tasks) => tasks.remove(&handle),
            Err(_) => None,
        };

        match removed {
            Some(task) => {
                task.abort();
                debug!("Cancelled {}", handle);
                true
            }
            None => {
                debug!("{} already fired or was cancelled", handle);
                false
            }
        }
    }
}
