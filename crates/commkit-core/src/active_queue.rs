//! Active queue input handler decorator
//!
//! Wraps an [`InputHandler`] so that the notifying thread only enqueues the item and
//! returns; a dedicated worker thread drains the bounded buffer and calls the inner
//! handler in FIFO order. What happens when the buffer is full is decided by the
//! configured [`OverflowPolicy`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::errors::{CommError, Result};
use crate::input::{HandlerId, InputHandler, InputSubject, Payload};

static WORKER_COUNTER: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters of one active queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveQueueStats {
    /// Items accepted into the buffer
    pub enqueued: u64,
    /// Items handed to the inner handler
    pub delivered: u64,
    /// Buffered items evicted by `DropOldest`
    pub dropped: u64,
    /// Arriving items refused (`RejectNew`, expired `Block`, or after stop)
    pub rejected: u64,
    /// Buffered items thrown away when the queue stopped
    pub discarded: u64,
}

#[derive(Default)]
struct StatCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ActiveQueueStats {
        ActiveQueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Shared Queue State
// ----------------------------------------------------------------------------

struct QueueState<T> {
    buffer: VecDeque<T>,
    cancelled: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    item_ready: Condvar,
    space_ready: Condvar,
    stats: StatCounters,
}

impl<T> QueueShared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock()
    }
}

/// Raised when the worker returns, including by unwinding out of the inner handler
struct ExitSignal(watch::Sender<bool>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

fn worker_loop<T: Payload>(
    shared: Arc<QueueShared<T>>,
    inner: Arc<dyn InputHandler<T>>,
    exit: ExitSignal,
) {
    let _exit = exit;
    loop {
        let item = {
            let mut state = shared.lock();
            loop {
                if state.cancelled {
                    return;
                }
                if let Some(item) = state.buffer.pop_front() {
                    break item;
                }
                shared.item_ready.wait(&mut state);
            }
        };
        shared.space_ready.notify_one();

        inner.handle_input(&item);
        shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Active Queue Decorator
// ----------------------------------------------------------------------------

/// Input handler that defers the inner handler to its own worker thread
pub struct ActiveQueueDecorator<T: Payload> {
    name: String,
    inner: Arc<dyn InputHandler<T>>,
    config: QueueConfig,
    shared: Arc<QueueShared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
    exited: watch::Receiver<bool>,
}

impl<T: Payload> ActiveQueueDecorator<T> {
    /// Wrap `inner` and start the worker thread
    pub fn new(inner: Arc<dyn InputHandler<T>>, config: QueueConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(CommError::config_error(
                "active queue capacity must be at least 1",
            ));
        }

        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(config.capacity),
                cancelled: false,
            }),
            item_ready: Condvar::new(),
            space_ready: Condvar::new(),
            stats: StatCounters::default(),
        });

        let name = format!(
            "active-queue-{}",
            WORKER_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let (exit_tx, exited) = watch::channel(false);
        let worker_shared = shared.clone();
        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(worker_shared, worker_inner, ExitSignal(exit_tx)))
            .map_err(|e| CommError::invalid_state(format!("failed to spawn {name}: {e}")))?;

        debug!(
            queue = %name,
            capacity = config.capacity,
            overflow = %config.overflow,
            "Active queue started"
        );

        Ok(Self {
            name,
            inner,
            config,
            shared,
            worker_thread: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
            exited,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of items waiting for the worker
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn stats(&self) -> ActiveQueueStats {
        self.shared.stats.snapshot()
    }

    /// Whether the worker thread is still running
    pub fn worker_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Stop the worker, discard buffered items and join the thread.
    ///
    /// Waiting for the worker is bounded by `stop_timeout_ms`. An inner handler
    /// stuck past that bound yields a timeout error; the worker keeps counting as
    /// alive and a later `stop` waits for it again. Stopping a stopped queue is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        let discarded = {
            let mut state = self.shared.lock();
            state.cancelled = true;
            let pending = state.buffer.len();
            state.buffer.clear();
            pending
        };
        self.shared
            .stats
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        self.shared.item_ready.notify_all();
        self.shared.space_ready.notify_all();

        // Stopped from inside the inner handler: the worker exits after returning.
        if self.worker_thread == thread::current().id() {
            debug!(queue = %self.name, "Active queue stopped from its own worker");
            return Ok(());
        }

        let timeout = self.config.stop_timeout();
        let mut exited = self.exited.clone();
        // A closed channel means the signal was dropped, which only happens on exit.
        if tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(queue = %self.name, timeout_ms = timeout.as_millis() as u64, "Active queue worker did not stop in time");
            return Err(CommError::timeout("active queue stop", timeout));
        }

        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        if handle.join().is_err() {
            warn!(queue = %self.name, "Active queue worker panicked");
        } else {
            debug!(queue = %self.name, discarded, "Active queue stopped");
        }
        Ok(())
    }

    fn reject(&self, reason: &'static str) {
        self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %self.name, reason, "Active queue rejected input");
    }
}

#[async_trait]
impl<T: Payload> InputHandler<T> for ActiveQueueDecorator<T> {
    fn handle_input(&self, input: &T) {
        let mut state = self.shared.lock();
        if state.cancelled {
            drop(state);
            self.reject("stopped");
            return;
        }

        if state.buffer.len() >= self.config.capacity {
            match self.config.overflow {
                OverflowPolicy::DropOldest => {
                    state.buffer.pop_front();
                    self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::RejectNew => {
                    drop(state);
                    self.reject("full");
                    return;
                }
                OverflowPolicy::Block => {
                    let deadline = Instant::now() + self.config.block_timeout();
                    while state.buffer.len() >= self.config.capacity && !state.cancelled {
                        let now = Instant::now();
                        if now >= deadline {
                            drop(state);
                            self.reject("block timeout");
                            return;
                        }
                        self.shared.space_ready.wait_until(&mut state, deadline);
                    }
                    if state.cancelled {
                        drop(state);
                        self.reject("stopped");
                        return;
                    }
                }
            }
        }

        state.buffer.push_back(input.clone());
        drop(state);
        self.shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.item_ready.notify_one();
    }

    fn inner(&self) -> Option<Arc<dyn InputHandler<T>>> {
        Some(self.inner.clone())
    }

    async fn release(&self) -> Result<()> {
        self.stop().await?;
        self.inner.release().await
    }
}

impl<T: Payload> Drop for ActiveQueueDecorator<T> {
    fn drop(&mut self) {
        self.shared.lock().cancelled = true;
        self.shared.item_ready.notify_all();
        self.shared.space_ready.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Subject Integration
// ----------------------------------------------------------------------------

impl<T: Payload> InputSubject<T> {
    /// Wrap the handler registered as `id` in an active queue, in place.
    ///
    /// Returns the decorator so callers can observe its statistics.
    pub fn decorate_active_queue(
        &self,
        id: HandlerId,
        config: QueueConfig,
    ) -> Result<Arc<ActiveQueueDecorator<T>>> {
        let mut created = None;
        self.decorate_with(id, |inner| {
            let decorator = Arc::new(ActiveQueueDecorator::new(inner, config)?);
            created = Some(decorator.clone());
            Ok(decorator as Arc<dyn InputHandler<T>>)
        })?;
        created.ok_or_else(|| CommError::invalid_state("active queue was not created"))
    }
}
