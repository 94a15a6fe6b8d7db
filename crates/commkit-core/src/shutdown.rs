//! Shutdown subject / observer pair
//!
//! A component owns one [`ShutdownSubject`]. Anything that must clean up when the
//! component goes down attaches a [`ShutdownObserver`]. The broadcast happens once;
//! later calls to [`ShutdownSubject::notify_shutdown`] do nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::errors::{CommError, Result};

// ----------------------------------------------------------------------------
// Observer Trait
// ----------------------------------------------------------------------------

/// Receiver of the component-wide shutdown broadcast
#[async_trait]
pub trait ShutdownObserver: Send + Sync {
    /// Called exactly once when the component shuts down
    async fn on_shutdown(&self);
}

/// Observer backed by an async closure
pub struct FnObserver<F>(F);

#[async_trait]
impl<F> ShutdownObserver for FnObserver<F>
where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn on_shutdown(&self) {
        (self.0)().await
    }
}

/// Wrap an async closure as a shutdown observer
pub fn observer_fn<F>(f: F) -> Arc<dyn ShutdownObserver>
where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    Arc::new(FnObserver(f))
}

/// Registration token of a shutdown observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Shutdown Subject
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Notifying,
    Done,
}

struct SubjectState {
    phase: Phase,
    pending: BTreeMap<ObserverId, Arc<dyn ShutdownObserver>>,
    next_id: u64,
}

/// Result of the one shutdown broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// Observers whose `on_shutdown` completed
    pub notified: usize,
    /// Observers that exceeded the per-observer timeout
    pub timed_out: Vec<ObserverId>,
    /// Whether this call performed the broadcast (false for repeated calls)
    pub performed: bool,
}

/// One-shot broadcast of the shutdown event to attached observers
pub struct ShutdownSubject {
    name: String,
    state: Mutex<SubjectState>,
}

impl ShutdownSubject {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SubjectState {
                phase: Phase::Open,
                pending: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubjectState> {
        self.state.lock()
    }

    /// Attach an observer.
    ///
    /// Observers attached while the broadcast is running are still notified in
    /// the same broadcast. Attaching after it finished fails.
    pub fn attach(&self, observer: Arc<dyn ShutdownObserver>) -> Result<ObserverId> {
        let mut state = self.lock();
        if state.phase == Phase::Done {
            return Err(CommError::already_shutdown(self.name.clone()));
        }
        let id = ObserverId(state.next_id);
        state.next_id += 1;
        state.pending.insert(id, observer);
        Ok(id)
    }

    /// Detach an observer that has not been notified yet
    pub fn detach(&self, id: ObserverId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether the broadcast has completed
    pub fn is_shut_down(&self) -> bool {
        self.lock().phase == Phase::Done
    }

    /// Broadcast shutdown to every attached observer, each bounded by `observer_timeout`.
    ///
    /// Only the first call notifies; any later call returns an outcome with
    /// `performed == false`.
    pub async fn notify_shutdown(&self, observer_timeout: Duration) -> ShutdownOutcome {
        {
            let mut state = self.lock();
            if state.phase != Phase::Open {
                return ShutdownOutcome::default();
            }
            state.phase = Phase::Notifying;
        }

        let mut outcome = ShutdownOutcome {
            performed: true,
            ..ShutdownOutcome::default()
        };

        loop {
            let batch = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.phase = Phase::Done;
                    break;
                }
                std::mem::take(&mut state.pending)
            };

            for (id, observer) in batch {
                match tokio::time::timeout(observer_timeout, observer.on_shutdown()).await {
                    Ok(()) => outcome.notified += 1,
                    Err(_) => {
                        warn!(subject = %self.name, observer = %id, "Shutdown observer timed out");
                        outcome.timed_out.push(id);
                    }
                }
            }
        }

        debug!(
            subject = %self.name,
            notified = outcome.notified,
            timed_out = outcome.timed_out.len(),
            "Shutdown broadcast complete"
        );
        outcome
    }
}

impl fmt::Debug for ShutdownSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ShutdownSubject")
            .field("name", &self.name)
            .field("phase", &state.phase)
            .field("observers", &state.pending.len())
            .finish()
    }
}
