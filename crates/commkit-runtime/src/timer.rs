//! Timer manager
//!
//! One-shot and periodic timers whose expiries are delivered to a
//! [`TimerHandler`]. Each timer runs as its own tokio task and calls its handler
//! on the blocking pool, so a slow handler delays only its own timer. A periodic
//! timer's next expiry is scheduled from the previous one, not from when the
//! handler returned.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use commkit_core::{CommError, CommResult};
use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::pattern::deliver_blocking;

/// Identifier of a scheduled timer, unique within its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Upcall for timer expiries
pub trait TimerHandler: Send + Sync {
    fn on_timer_expired(&self, id: TimerId);
}

struct FnTimerHandler<F>(F);

impl<F> TimerHandler for FnTimerHandler<F>
where
    F: Fn(TimerId) + Send + Sync,
{
    fn on_timer_expired(&self, id: TimerId) {
        (self.0)(id)
    }
}

/// Wrap a closure as a timer handler
pub fn timer_handler_fn<F>(f: F) -> Arc<dyn TimerHandler>
where
    F: Fn(TimerId) + Send + Sync + 'static,
{
    Arc::new(FnTimerHandler(f))
}

struct TimerEntry {
    handler: Arc<dyn TimerHandler>,
    interval: watch::Sender<Option<Duration>>,
    task: JoinHandle<()>,
}

type TimerTable = DashMap<TimerId, TimerEntry>;

/// Owner of a set of timers
pub struct TimerManager {
    name: String,
    next_id: AtomicU64,
    timers: Arc<TimerTable>,
    closed: AtomicBool,
}

impl TimerManager {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            timers: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Schedule a timer expiring after `first`, then every `interval` if given.
    ///
    /// Fails with `AlreadyShutdown` once the manager is closed.
    pub fn schedule_timer(
        &self,
        handler: Arc<dyn TimerHandler>,
        first: Duration,
        interval: Option<Duration>,
    ) -> CommResult<TimerId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommError::already_shutdown(self.name.clone()));
        }
        if interval == Some(Duration::ZERO) {
            return Err(CommError::config_error("timer interval must be positive"));
        }

        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (interval_tx, interval_rx) = watch::channel(interval);
        let (armed_tx, armed_rx) = oneshot::channel();
        let task = tokio::spawn(run_timer(
            id,
            Instant::now() + first,
            handler.clone(),
            interval_rx,
            Arc::downgrade(&self.timers),
            format!("{}/{}", self.name, id),
            armed_rx,
        ));
        self.timers.insert(
            id,
            TimerEntry {
                handler,
                interval: interval_tx,
                task,
            },
        );
        // The task only runs once its entry is in the table.
        let _ = armed_tx.send(());

        debug!(timers = %self.name, timer = %id, first_ms = first.as_millis() as u64, periodic = interval.is_some(), "Timer scheduled");
        Ok(id)
    }

    /// Cancel one timer. A handler call already in progress still completes.
    pub fn cancel_timer(&self, id: TimerId) -> CommResult<()> {
        let (_, entry) = self
            .timers
            .remove(&id)
            .ok_or(CommError::WrongId(id.value()))?;
        entry.task.abort();
        debug!(timers = %self.name, timer = %id, "Timer cancelled");
        Ok(())
    }

    /// Change the period of a timer, effective after its next expiry.
    ///
    /// `None` turns a periodic timer into one that expires once more.
    pub fn reset_timer_interval(&self, id: TimerId, interval: Option<Duration>) -> CommResult<()> {
        if interval == Some(Duration::ZERO) {
            return Err(CommError::config_error("timer interval must be positive"));
        }
        let entry = self
            .timers
            .get(&id)
            .ok_or(CommError::WrongId(id.value()))?;
        entry.interval.send_replace(interval);
        Ok(())
    }

    /// Cancel every timer delivering to `handler`; returns how many were cancelled
    pub fn cancel_timers_of(&self, handler: &Arc<dyn TimerHandler>) -> usize {
        let target = Arc::as_ptr(handler) as *const ();
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|entry| Arc::as_ptr(&entry.handler) as *const () == target)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.cancel_timer(*id).is_ok())
            .count()
    }

    /// Cancel every timer; returns how many were cancelled
    pub fn cancel_all_timers(&self) -> usize {
        let ids: Vec<TimerId> = self.timers.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.cancel_timer(*id).is_ok())
            .count()
    }

    /// Refuse new timers and cancel the scheduled ones
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.cancel_all_timers();
        if cancelled > 0 {
            debug!(timers = %self.name, cancelled, "Timer manager closed");
        }
        cancelled
    }

    /// Number of scheduled timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("name", &self.name)
            .field("scheduled", &self.timers.len())
            .finish()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.task.abort();
        }
    }
}

async fn run_timer(
    id: TimerId,
    mut next: Instant,
    handler: Arc<dyn TimerHandler>,
    mut interval: watch::Receiver<Option<Duration>>,
    timers: Weak<TimerTable>,
    label: String,
    armed: oneshot::Receiver<()>,
) {
    if armed.await.is_err() {
        return;
    }

    loop {
        tokio::time::sleep_until(next).await;
        let expired = handler.clone();
        deliver_blocking(&label, move || expired.on_timer_expired(id)).await;
        trace!(timer = %label, "Timer expired");

        let period = *interval.borrow_and_update();
        match period {
            // A handler that overran its period fires the next expiry right away.
            Some(period) => next = (next + period).max(Instant::now()),
            None => break,
        }
    }

    if let Some(timers) = timers.upgrade() {
        timers.remove(&id);
    }
}
