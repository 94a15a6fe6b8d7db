//! Managed tasks
//!
//! A [`Task`] drives a [`TaskBody`] on its own tokio task: `on_entry` once, then
//! `on_execute` according to its [`TaskSchedule`], then `on_exit` once. Stopping
//! is cooperative: a stop request is observed between iterations, and a stop
//! that does not complete within its timeout aborts the execution and
//! force-marks the task stopped.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commkit_core::{CommError, CommResult, InputHandler, Payload, UniversalId};
use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

// ----------------------------------------------------------------------------
// Task Body
// ----------------------------------------------------------------------------

/// Whether a task wants another iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlow {
    Continue,
    Finish,
}

/// User code run by a [`Task`]
#[async_trait]
pub trait TaskBody: Send + 'static {
    /// Runs once before the first iteration
    async fn on_entry(&mut self) -> CommResult<()> {
        Ok(())
    }

    /// One iteration of work
    async fn on_execute(&mut self) -> CommResult<TaskFlow>;

    /// Runs once after the last iteration, also after a failed one
    async fn on_exit(&mut self) -> CommResult<()> {
        Ok(())
    }
}

/// Task body backed by a closure producing one iteration future
pub struct FnTask<F>(F);

#[async_trait]
impl<F> TaskBody for FnTask<F>
where
    F: FnMut() -> BoxFuture<'static, CommResult<TaskFlow>> + Send + 'static,
{
    async fn on_execute(&mut self) -> CommResult<TaskFlow> {
        (self.0)().await
    }
}

/// Wrap a closure as a task body
pub fn task_fn<F>(f: F) -> FnTask<F>
where
    F: FnMut() -> BoxFuture<'static, CommResult<TaskFlow>> + Send + 'static,
{
    FnTask(f)
}

// ----------------------------------------------------------------------------
// Triggers
// ----------------------------------------------------------------------------

/// Wake-up source for [`TaskSchedule::Triggered`] tasks
///
/// Triggers fired while the task is busy coalesce into one pending wake-up.
#[derive(Clone, Default)]
pub struct TaskTrigger {
    notify: Arc<Notify>,
    fired: Arc<AtomicU64>,
}

impl TaskTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Number of times the trigger fired
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    async fn triggered(&self) {
        self.notify.notified().await
    }
}

impl fmt::Debug for TaskTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTrigger")
            .field("fired", &self.fired())
            .finish()
    }
}

/// Input handler that fires a task trigger on every input
pub struct InputTaskTrigger<T> {
    trigger: TaskTrigger,
    _marker: PhantomData<fn(T)>,
}

impl<T> InputTaskTrigger<T> {
    pub fn new(trigger: TaskTrigger) -> Self {
        Self {
            trigger,
            _marker: PhantomData,
        }
    }
}

impl<T: Payload> InputHandler<T> for InputTaskTrigger<T> {
    fn handle_input(&self, _input: &T) {
        self.trigger.trigger();
    }
}

// ----------------------------------------------------------------------------
// Schedule & State
// ----------------------------------------------------------------------------

/// When `on_execute` runs
#[derive(Debug, Clone)]
pub enum TaskSchedule {
    /// Exactly once
    OneShot,
    /// Back to back until finished or stopped
    Continuous,
    /// Once per interval
    Periodic(Duration),
    /// Once per trigger
    Triggered(TaskTrigger),
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => f.write_str("created"),
            TaskState::Running => f.write_str("running"),
            TaskState::Stopped => f.write_str("stopped"),
        }
    }
}

struct Shared {
    state: Mutex<TaskState>,
    failure: Mutex<Option<CommError>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock()
    }

    fn record_failure(&self, error: CommError) {
        *self.failure.lock() = Some(error);
    }
}

// ----------------------------------------------------------------------------
// Task
// ----------------------------------------------------------------------------

/// Schedulable unit of work owned by a component
pub struct Task {
    name: String,
    id: UniversalId,
    schedule: TaskSchedule,
    shared: Arc<Shared>,
    body: Mutex<Option<Box<dyn TaskBody>>>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn new<S, B>(name: S, id: UniversalId, schedule: TaskSchedule, body: B) -> Self
    where
        S: Into<String>,
        B: TaskBody,
    {
        let (stop, _) = watch::channel(false);
        Self {
            name: name.into(),
            id,
            schedule,
            shared: Arc::new(Shared {
                state: Mutex::new(TaskState::Created),
                failure: Mutex::new(None),
            }),
            body: Mutex::new(Some(Box::new(body))),
            stop,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> UniversalId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Error the body ended with, if any
    pub fn failure(&self) -> Option<CommError> {
        self.shared.failure.lock().clone()
    }

    /// Begin execution; a no-op when already running.
    ///
    /// Fails with `InvalidState` once the task has stopped.
    pub fn start(&self) -> CommResult<()> {
        let mut state = self.shared.state();
        match *state {
            TaskState::Running => return Ok(()),
            TaskState::Stopped => {
                return Err(CommError::invalid_state(format!(
                    "task '{}' has stopped and cannot be restarted",
                    self.name
                )))
            }
            TaskState::Created => {}
        }

        let body = self
            .body
            .lock()
            .take()
            .ok_or_else(|| CommError::invalid_state(format!("task '{}' has no body", self.name)))?;

        let handle = tokio::spawn(run(
            self.name.clone(),
            body,
            self.schedule.clone(),
            self.stop.subscribe(),
            self.shared.clone(),
        ));
        *self.handle.lock() = Some(handle);
        *state = TaskState::Running;
        info!(task = %self.name, id = %self.id, "Task started");
        Ok(())
    }

    /// Request cooperative termination and wait up to `timeout` for it.
    ///
    /// On timeout the execution is aborted, the task is marked stopped and
    /// `TaskStopTimeout` is returned. Stopping a task that never started just
    /// marks it stopped.
    pub async fn stop(&self, timeout: Duration) -> CommResult<()> {
        self.stop.send_replace(true);

        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            *self.shared.state() = TaskState::Stopped;
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!(task = %self.name, error = %e, "Task ended abnormally");
                }
                *self.shared.state() = TaskState::Stopped;
                debug!(task = %self.name, "Task stopped");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                *self.shared.state() = TaskState::Stopped;
                let error = CommError::TaskStopTimeout {
                    task: self.name.clone(),
                    timeout,
                };
                warn!(task = %self.name, timeout_ms = timeout.as_millis() as u64, "Task did not stop in time; aborted");
                self.shared.record_failure(error.clone());
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------------

async fn run(
    name: String,
    mut body: Box<dyn TaskBody>,
    schedule: TaskSchedule,
    mut stop: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    let result = match body.on_entry().await {
        Ok(()) => {
            let iterations = iterate(body.as_mut(), &schedule, &mut stop).await;
            let exit = body.on_exit().await;
            iterations.and(exit)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(task = %name, error = %e, "Task failed");
        shared.record_failure(e);
    } else {
        debug!(task = %name, "Task finished");
    }
    *shared.state() = TaskState::Stopped;
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Resolves when a stop is requested (or the task handle is gone)
async fn stopping(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn iterate(
    body: &mut dyn TaskBody,
    schedule: &TaskSchedule,
    stop: &mut watch::Receiver<bool>,
) -> CommResult<()> {
    match schedule {
        TaskSchedule::OneShot => {
            if !stop_requested(stop) {
                body.on_execute().await?;
            }
        }
        TaskSchedule::Continuous => {
            while !stop_requested(stop) {
                if body.on_execute().await? == TaskFlow::Finish {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        TaskSchedule::Periodic(period) => {
            let mut ticker = tokio::time::interval(*period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopping(stop) => break,
                }
                if body.on_execute().await? == TaskFlow::Finish {
                    break;
                }
            }
        }
        TaskSchedule::Triggered(trigger) => loop {
            tokio::select! {
                _ = trigger.triggered() => {}
                _ = stopping(stop) => break,
            }
            if body.on_execute().await? == TaskFlow::Finish {
                break;
            }
        },
    }
    Ok(())
}
