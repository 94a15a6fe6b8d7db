//! Input subject / input handler observer pair
//!
//! Patterns that receive data (push servers, query servers) own an [`InputSubject`]
//! and deliver every arriving item to the [`InputHandler`]s registered on it.
//! Delivery is synchronous and in registration order. Handlers can be wrapped by
//! decorators (see [`crate::active_queue`]) without the subject noticing: the
//! decorator takes over the registration slot of the handler it wraps, so the
//! [`HandlerId`] stays valid across decoration.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::{CommError, Result};
use crate::prescale::PrescaleManager;

// ----------------------------------------------------------------------------
// Payload Bound
// ----------------------------------------------------------------------------

/// Anything that can travel through a pattern
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

// ----------------------------------------------------------------------------
// Input Handler Trait
// ----------------------------------------------------------------------------

/// Upcall interface for incoming data
#[async_trait]
pub trait InputHandler<T: Payload>: Send + Sync {
    /// Handle one input item. Called on the notifying thread.
    fn handle_input(&self, input: &T);

    /// The handler wrapped by this one, if this is a decorator
    fn inner(&self) -> Option<Arc<dyn InputHandler<T>>> {
        None
    }

    /// Release everything held on behalf of the subject (worker threads, buffers).
    ///
    /// Called by the subject when the handler is deregistered, before the
    /// deregistration returns. Decorators release themselves and then their inner
    /// handler.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapts a closure into an [`InputHandler`]
pub struct FnHandler<F>(F);

impl<T, F> InputHandler<T> for FnHandler<F>
where
    T: Payload,
    F: Fn(&T) + Send + Sync,
{
    fn handle_input(&self, input: &T) {
        (self.0)(input)
    }
}

/// Wrap a closure as a shareable input handler
pub fn handler_fn<T, F>(f: F) -> Arc<dyn InputHandler<T>>
where
    T: Payload,
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// ----------------------------------------------------------------------------
// Handler Registration
// ----------------------------------------------------------------------------

/// Registration token identifying one slot of an [`InputSubject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

struct HandlerEntry<T: Payload> {
    id: HandlerId,
    handler: Arc<dyn InputHandler<T>>,
    prescale: Mutex<PrescaleManager>,
}

impl<T: Payload> HandlerEntry<T> {
    fn update_due(&self) -> bool {
        self.prescale.lock().is_update_due()
    }
}

// ----------------------------------------------------------------------------
// Input Subject
// ----------------------------------------------------------------------------

/// Ordered set of input handlers notified on every new item
pub struct InputSubject<T: Payload> {
    name: String,
    entries: RwLock<Vec<Arc<HandlerEntry<T>>>>,
    next_id: AtomicU64,
}

impl<T: Payload> InputSubject<T> {
    /// Create an empty subject; the name only appears in logs
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler that sees every update
    pub fn register(&self, handler: Arc<dyn InputHandler<T>>) -> HandlerId {
        self.insert(handler, PrescaleManager::every_update())
    }

    /// Register a handler that sees every `prescale`-th update
    pub fn register_with_prescale(
        &self,
        handler: Arc<dyn InputHandler<T>>,
        prescale: u32,
    ) -> Result<HandlerId> {
        let manager = PrescaleManager::new(prescale)?;
        Ok(self.insert(handler, manager))
    }

    fn insert(&self, handler: Arc<dyn InputHandler<T>>, prescale: PrescaleManager) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(HandlerEntry {
            id,
            handler,
            prescale: Mutex::new(prescale),
        });
        self.entries.write().push(entry);
        debug!(subject = %self.name, handler = %id, "Input handler registered");
        id
    }

    /// Remove a handler and release its resources before returning.
    ///
    /// Returns the removed (outermost) handler. A decorated handler is not put
    /// back anywhere; use [`InputHandler::inner`] to re-register it explicitly.
    /// The slot stays registered until the release succeeds, so a failed
    /// deregistration can be retried with the same id.
    pub async fn deregister(&self, id: HandlerId) -> Result<Arc<dyn InputHandler<T>>> {
        let entry = self
            .entries
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| {
                CommError::invalid_state(format!(
                    "handler {id} is not registered on '{}'",
                    self.name
                ))
            })?;

        if let Err(e) = entry.handler.release().await {
            warn!(subject = %self.name, handler = %id, error = %e, "Input handler kept after failed release");
            return Err(e);
        }

        self.entries
            .write()
            .retain(|current| !Arc::ptr_eq(current, &entry));
        debug!(subject = %self.name, handler = %id, "Input handler deregistered");
        Ok(entry.handler.clone())
    }

    /// Replace the handler in slot `id` with a wrapper around it.
    ///
    /// The slot keeps its id, position and prescale state.
    pub fn decorate_with<F>(&self, id: HandlerId, wrap: F) -> Result<Arc<dyn InputHandler<T>>>
    where
        F: FnOnce(Arc<dyn InputHandler<T>>) -> Result<Arc<dyn InputHandler<T>>>,
    {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| {
                CommError::invalid_state(format!(
                    "handler {id} is not registered on '{}'",
                    self.name
                ))
            })?;

        let current = &entries[position];
        let wrapped = wrap(current.handler.clone())?;
        let prescale = current.prescale.lock().clone();
        entries[position] = Arc::new(HandlerEntry {
            id,
            handler: wrapped.clone(),
            prescale: Mutex::new(prescale),
        });
        debug!(subject = %self.name, handler = %id, "Input handler decorated");
        Ok(wrapped)
    }

    /// Deliver `input` to every registered handler, in registration order.
    ///
    /// Returns whether at least one handler was registered. Handlers run on a
    /// snapshot of the registrations, so they may (de)register re-entrantly.
    pub fn notify(&self, input: &T) -> bool {
        let snapshot: Vec<Arc<HandlerEntry<T>>> = self.entries.read().clone();

        for entry in &snapshot {
            if entry.update_due() {
                entry.handler.handle_input(input);
            }
        }
        !snapshot.is_empty()
    }

    /// Deregister every handler, releasing each one.
    ///
    /// All handlers are released even if some fail; those stay registered and the
    /// first failure is returned. On success returns the number removed.
    pub async fn clear(&self) -> Result<usize> {
        let snapshot: Vec<Arc<HandlerEntry<T>>> = self.entries.read().clone();

        let mut released = Vec::with_capacity(snapshot.len());
        let mut first_error = None;
        for entry in snapshot {
            match entry.handler.release().await {
                Ok(()) => released.push(entry),
                Err(e) => {
                    warn!(subject = %self.name, handler = %entry.id, error = %e, "Failed to release input handler");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.entries
            .write()
            .retain(|current| !released.iter().any(|done| Arc::ptr_eq(current, done)));

        match first_error {
            Some(e) => Err(e),
            None => Ok(released.len()),
        }
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.entries
            .read()
            .iter()
            .any(|entry| entry.id == id)
    }

    /// Registered ids in delivery order
    pub fn handler_ids(&self) -> Vec<HandlerId> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Payload> fmt::Debug for InputSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSubject")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}
