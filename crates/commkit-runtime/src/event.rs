//! Event pattern
//!
//! An [`EventClient`] activates events on an [`EventServer`], each activation
//! carrying a parameter and an [`EventMode`]. Whenever the server publishes a new
//! state through [`EventServer::put`], its [`EventTestHandler`] decides per
//! activation whether that state fires an event. Fired events are kept on the
//! client per activation, where a continuous activation keeps only the newest
//! one, and are also handed to the client's input subject as [`EventInput`]s.
//!
//! Disconnecting, reconnecting or losing the server removes every activation of
//! the client; waiting calls then fail with `NotConnected`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commkit_core::{
    CommError, CommResult, EventId, HandlerId, InputHandler, InputSubject, Payload,
    ServiceAddress, UniversalId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::communication::{Binding, CommunicationObject, Link};
use crate::component::ComponentContext;
use crate::naming::{resolve_endpoint, ServiceDescriptor};
use crate::pattern::{
    deliver_blocking, BlockingControl, ClientPattern, ManagedPattern, ServerPattern,
};

// ----------------------------------------------------------------------------
// Modes & Status
// ----------------------------------------------------------------------------

/// How often an activation fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Fires at most once, then stays passive
    Single,
    /// Fires on every matching state; only the newest event is kept
    Continuous,
}

impl fmt::Display for EventMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventMode::Single => f.write_str("single"),
            EventMode::Continuous => f.write_str("continuous"),
        }
    }
}

/// Result of polling an activation with [`EventClient::try_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// An event is waiting to be collected
    Fired,
    /// Activated, nothing to collect yet
    Active,
    /// Single activation whose event was already collected
    Passive,
}

/// One fired event as seen by the client's input subject
#[derive(Debug, Clone)]
pub struct EventInput<E> {
    pub id: EventId,
    pub event: E,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

/// Client-side upcall for fired events
pub trait EventHandler<E>: Send + Sync {
    fn handle_event(&self, id: EventId, event: &E);
}

struct FnEventHandler<F>(F);

impl<E, F> EventHandler<E> for FnEventHandler<F>
where
    F: Fn(EventId, &E) + Send + Sync,
{
    fn handle_event(&self, id: EventId, event: &E) {
        (self.0)(id, event)
    }
}

/// Wrap a closure as an event handler
pub fn event_handler_fn<E, F>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: 'static,
    F: Fn(EventId, &E) + Send + Sync + 'static,
{
    Arc::new(FnEventHandler(f))
}

/// Input handler forwarding each [`EventInput`] to an [`EventHandler`]
pub struct EventHandlerAdapter<E> {
    handler: Arc<dyn EventHandler<E>>,
}

impl<E> EventHandlerAdapter<E> {
    pub fn new(handler: Arc<dyn EventHandler<E>>) -> Self {
        Self { handler }
    }
}

impl<E: Payload> InputHandler<EventInput<E>> for EventHandlerAdapter<E> {
    fn handle_input(&self, input: &EventInput<E>) {
        self.handler.handle_event(input.id, &input.event);
    }
}

/// Server-side condition check run for every activation on every new state
pub trait EventTestHandler<P, E, S>: Send + Sync {
    /// The event `state` fires for an activation with `param`, if any.
    ///
    /// Runs while the server's activation list is locked, so it must not call
    /// back into the server. `param` may be updated to carry state between
    /// checks of the same activation.
    fn test_event(&self, param: &mut P, state: &S) -> Option<E>;

    /// Called once when a client activates with `param`
    fn on_activation(&self, _param: &P) {}
}

struct FnEventTest<F>(F);

impl<P, E, S, F> EventTestHandler<P, E, S> for FnEventTest<F>
where
    F: Fn(&mut P, &S) -> Option<E> + Send + Sync,
{
    fn test_event(&self, param: &mut P, state: &S) -> Option<E> {
        (self.0)(param, state)
    }
}

/// Wrap a closure as an event test handler
pub fn event_test_fn<P, E, S, F>(f: F) -> Arc<dyn EventTestHandler<P, E, S>>
where
    P: 'static,
    E: 'static,
    S: 'static,
    F: Fn(&mut P, &S) -> Option<E> + Send + Sync + 'static,
{
    Arc::new(FnEventTest(f))
}

// ----------------------------------------------------------------------------
// Client-Side Activation Table
// ----------------------------------------------------------------------------

struct Slot<E> {
    mode: EventMode,
    /// Newest event not yet collected
    latest: Option<E>,
    fired: bool,
    received: u64,
}

impl<E> Slot<E> {
    fn status(&self) -> EventStatus {
        if self.latest.is_some() {
            EventStatus::Fired
        } else if self.mode == EventMode::Single && self.fired {
            EventStatus::Passive
        } else {
            EventStatus::Active
        }
    }
}

/// Activations of one client, shared with the servers firing into it
struct EventSink<E> {
    slots: Mutex<HashMap<EventId, Slot<E>>>,
    changes: watch::Sender<u64>,
    forward: mpsc::UnboundedSender<EventInput<E>>,
}

impl<E: Payload> EventSink<E> {
    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Record a fired event; false if the activation no longer exists
    fn deliver(&self, id: EventId, event: E) -> bool {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&id) else {
                return false;
            };
            slot.latest = Some(event.clone());
            slot.fired = true;
            slot.received += 1;
            // Only fails once the client stopped its receive task.
            let _ = self.forward.send(EventInput { id, event });
        }
        self.bump();
        true
    }

    fn remove(&self, id: EventId) -> bool {
        let removed = self.slots.lock().remove(&id).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    fn clear(&self) -> usize {
        let count = {
            let mut slots = self.slots.lock();
            let count = slots.len();
            slots.clear();
            count
        };
        self.bump();
        count
    }
}

// ----------------------------------------------------------------------------
// In-Process Link
// ----------------------------------------------------------------------------

struct ServerActivation<P, E> {
    client: UniversalId,
    id: EventId,
    mode: EventMode,
    param: P,
    sink: Arc<EventSink<E>>,
}

type ActivationList<P, E> = Arc<Mutex<Vec<ServerActivation<P, E>>>>;

/// Server endpoint published through the naming service
pub struct EventEndpoint<P, E> {
    activations: ActivationList<P, E>,
    on_activation: Arc<dyn Fn(&P) + Send + Sync>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Receiver<bool>,
}

impl<P, E> EventEndpoint<P, E> {
    fn activate(&self, activation: ServerActivation<P, E>) {
        (self.on_activation)(&activation.param);
        self.activations.lock().push(activation);
    }

    fn deactivate(&self, client: UniversalId, id: EventId) {
        self.activations
            .lock()
            .retain(|activation| !(activation.client == client && activation.id == id));
    }

    fn drop_client(&self, client: UniversalId) {
        self.activations
            .lock()
            .retain(|activation| activation.client != client);
    }
}

/// Client side of an event connection
pub struct EventLink<P, E> {
    endpoint: Arc<EventEndpoint<P, E>>,
    client: UniversalId,
}

impl<P, E> Clone for EventLink<P, E> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            client: self.client,
        }
    }
}

impl<P: Payload, E: Payload> Link for EventLink<P, E> {
    fn is_closed(&self) -> bool {
        !*self.endpoint.alive.borrow()
    }

    fn release(&self) {
        self.endpoint.clients.remove(&self.client);
        self.endpoint.drop_client(self.client);
    }
}

impl<P, E> EventLink<P, E> {
    async fn server_gone(&self) {
        let mut alive = self.endpoint.alive.clone();
        let _ = alive.wait_for(|alive| !*alive).await;
    }
}

// ----------------------------------------------------------------------------
// Event Client
// ----------------------------------------------------------------------------

enum Wake {
    Changed,
    Timeout,
    Cancelled,
    ServerGone,
}

/// Activating side of the event pattern
pub struct EventClient<P: Payload, E: Payload> {
    id: UniversalId,
    context: ComponentContext,
    comm: CommunicationObject<EventLink<P, E>>,
    blocking: BlockingControl,
    next_event: AtomicU64,
    sink: Arc<EventSink<E>>,
    subject: Arc<InputSubject<EventInput<E>>>,
    alive: watch::Sender<bool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<P: Payload, E: Payload> EventClient<P, E> {
    /// Create the client and start the task feeding its input subject
    pub(crate) fn new(context: ComponentContext) -> Self {
        let id = context.allocate_id();
        let label = format!("{}/event-client/{}", context.component_name(), id);
        let (forward, mut rx) = mpsc::unbounded_channel::<EventInput<E>>();
        let (changes, _) = watch::channel(0);
        let (alive, mut stop) = watch::channel(true);
        let subject = Arc::new(InputSubject::new(label.clone()));

        let task_subject = subject.clone();
        let task_label = label.clone();
        let receiver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    input = rx.recv() => match input {
                        Some(input) => {
                            let subject = task_subject.clone();
                            deliver_blocking(&task_label, move || subject.notify(&input)).await;
                        }
                        None => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || !*stop.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!(client = %task_label, "Event receive task stopped");
        });

        Self {
            id,
            blocking: BlockingControl::new(context.blocking_receiver()),
            comm: CommunicationObject::new(label),
            next_event: AtomicU64::new(1),
            sink: Arc::new(EventSink {
                slots: Mutex::new(HashMap::new()),
                changes,
                forward,
            }),
            subject,
            alive,
            receiver: Mutex::new(Some(receiver)),
            stopped: AtomicBool::new(false),
            context,
        }
    }

    pub fn id(&self) -> UniversalId {
        self.id
    }

    /// Subject every fired event is delivered to
    pub fn subject(&self) -> &Arc<InputSubject<EventInput<E>>> {
        &self.subject
    }

    /// Register an event handler on [`EventClient::subject`]
    pub fn register_handler(&self, handler: Arc<dyn EventHandler<E>>) -> HandlerId {
        self.subject.register(Arc::new(EventHandlerAdapter::new(handler)))
    }

    /// Number of activations currently held
    pub fn active_count(&self) -> usize {
        self.sink.slots.lock().len()
    }

    fn drop_activations(&self, reason: &'static str) {
        let dropped = self.sink.clear();
        if dropped > 0 {
            debug!(client = %self.id, dropped, reason, "Event activations dropped");
        }
    }

    async fn live_binding(&self) -> CommResult<Binding<EventLink<P, E>>> {
        match self.comm.live_binding().await {
            Ok(binding) => Ok(binding),
            Err(e) => {
                self.drop_activations("server gone");
                Err(e)
            }
        }
    }

    async fn close_binding(&self, generation: u64) {
        if self.comm.disconnect_generation(generation).await {
            self.drop_activations("server gone");
        }
    }

    /// Activate an event with `param` on the bound server
    pub async fn activate(&self, mode: EventMode, param: P) -> CommResult<EventId> {
        let binding = self.live_binding().await?;
        let id = EventId::new(self.next_event.fetch_add(1, Ordering::Relaxed));
        self.sink.slots.lock().insert(
            id,
            Slot {
                mode,
                latest: None,
                fired: false,
                received: 0,
            },
        );
        binding.link.endpoint.activate(ServerActivation {
            client: self.id,
            id,
            mode,
            param,
            sink: self.sink.clone(),
        });

        // The binding may have been released while the activation was registered.
        if self.comm.binding().map(|current| current.generation).ok() != Some(binding.generation) {
            binding.link.endpoint.deactivate(self.id, id);
            self.sink.remove(id);
            return Err(CommError::NotConnected);
        }
        debug!(client = %self.id, event = %id, %mode, "Event activated");
        Ok(id)
    }

    /// Remove an activation; its pending event is discarded
    pub fn deactivate(&self, id: EventId) -> CommResult<()> {
        if !self.comm.is_connected() {
            return Err(CommError::NotConnected);
        }
        if !self.sink.remove(id) {
            return Err(CommError::WrongId(id.value()));
        }
        if let Ok(link) = self.comm.link() {
            link.endpoint.deactivate(self.id, id);
        }
        debug!(client = %self.id, event = %id, "Event deactivated");
        Ok(())
    }

    /// Poll an activation without waiting or consuming its event
    pub fn try_event(&self, id: EventId) -> CommResult<EventStatus> {
        if !self.comm.is_connected() {
            return Err(CommError::NotConnected);
        }
        self.sink
            .slots
            .lock()
            .get(&id)
            .map(Slot::status)
            .ok_or(CommError::WrongId(id.value()))
    }

    /// Collect the activation's event, waiting up to `timeout` if none is pending.
    ///
    /// A single activation whose event was already collected fails with
    /// `EventConsumed`.
    pub async fn get_event(&self, id: EventId, timeout: Duration) -> CommResult<E> {
        self.wait_event(id, timeout, false).await
    }

    /// Wait up to `timeout` for an event fired after this call, ignoring a
    /// pending one.
    ///
    /// A single activation that has already fired fails with `EventConsumed`.
    pub async fn get_next_event(&self, id: EventId, timeout: Duration) -> CommResult<E> {
        self.wait_event(id, timeout, true).await
    }

    async fn wait_event(&self, id: EventId, timeout: Duration, next: bool) -> CommResult<E> {
        if !self.blocking.is_blocking() {
            return Err(CommError::Cancelled);
        }
        let deadline = Instant::now() + timeout;
        let binding = self.live_binding().await?;
        let mut changes = self.sink.changes.subscribe();

        let mut since = {
            let slots = self.sink.slots.lock();
            let slot = slots.get(&id).ok_or(CommError::WrongId(id.value()))?;
            next.then_some(slot.received)
        };

        loop {
            {
                let mut slots = self.sink.slots.lock();
                let Some(slot) = slots.get_mut(&id) else {
                    return Err(if self.comm.is_connected() {
                        CommError::NotActivated(id.value())
                    } else {
                        CommError::NotConnected
                    });
                };
                let fresh = since.map_or(true, |seen| slot.received > seen);
                if fresh {
                    if let Some(event) = slot.latest.take() {
                        trace!(client = %self.id, event = %id, "Event collected");
                        return Ok(event);
                    }
                }
                if slot.mode == EventMode::Single && slot.fired {
                    return Err(CommError::EventConsumed(id.value()));
                }
                // Someone else collected the event this call was waiting for.
                if let Some(seen) = since.as_mut() {
                    *seen = slot.received;
                }
            }

            let wake = tokio::select! {
                biased;
                _ = changes.changed() => Wake::Changed,
                _ = tokio::time::sleep_until(deadline) => Wake::Timeout,
                _ = self.blocking.cancelled() => Wake::Cancelled,
                _ = binding.link.server_gone() => Wake::ServerGone,
            };
            match wake {
                Wake::Changed => {}
                Wake::Timeout => return Err(CommError::timeout("event", timeout)),
                Wake::Cancelled => return Err(CommError::Cancelled),
                Wake::ServerGone => {
                    self.close_binding(binding.generation).await;
                    return Err(CommError::NotConnected);
                }
            }
        }
    }

    /// Stop the receive task and release every handler
    async fn stop_delivery(&self) -> CommResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.alive.send_replace(false);
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                warn!(client = %self.id, error = %e, "Event receive task ended abnormally");
            }
        }
        self.subject.clear().await?;
        Ok(())
    }
}

#[async_trait]
impl<P: Payload, E: Payload> ClientPattern for EventClient<P, E> {
    /// Bind to an event server; activations of a previous binding are dropped
    async fn connect(&self, server: &str, service: &str) -> CommResult<()> {
        let naming = self.context.naming().clone();
        let client = self.id;
        let owner = self.context.component_name().to_string();
        let result = self
            .comm
            .connect_with(ServiceAddress::new(server, service), |address| {
                let endpoint = resolve_endpoint::<EventEndpoint<P, E>>(
                    naming.as_ref(),
                    address,
                    &ServiceDescriptor::event::<P, E>(),
                )?;
                if !*endpoint.alive.borrow() {
                    return Err(CommError::communication(format!("{address} is shutting down")));
                }
                endpoint.clients.insert(client, owner);
                Ok(EventLink { endpoint, client })
            })
            .await;
        self.drop_activations("reconnect");
        result
    }

    /// Release the binding; every activation is dropped
    async fn disconnect(&self) -> CommResult<()> {
        self.comm.disconnect().await?;
        self.drop_activations("disconnect");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.comm.is_connected()
    }

    fn address(&self) -> Option<ServiceAddress> {
        self.comm.address()
    }

    fn set_blocking(&self, blocking: bool) {
        self.blocking.set_blocking(blocking);
    }
}

#[async_trait]
impl<P: Payload, E: Payload> ManagedPattern for EventClient<P, E> {
    fn describe(&self) -> String {
        self.comm.label().to_string()
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        ClientPattern::disconnect(self).await?;
        self.stop_delivery().await
    }
}

impl<P: Payload, E: Payload> Drop for EventClient<P, E> {
    fn drop(&mut self) {
        self.alive.send_replace(false);
    }
}

// ----------------------------------------------------------------------------
// Event Server
// ----------------------------------------------------------------------------

/// Firing side of the event pattern
pub struct EventServer<P: Payload, E: Payload, S: Send + Sync + 'static> {
    id: UniversalId,
    address: ServiceAddress,
    context: ComponentContext,
    handler: Arc<dyn EventTestHandler<P, E, S>>,
    activations: ActivationList<P, E>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Sender<bool>,
    fired: AtomicU64,
    stopped: AtomicBool,
}

impl<P: Payload, E: Payload, S: Send + Sync + 'static> EventServer<P, E, S> {
    /// Register the service port
    pub(crate) fn new(
        context: ComponentContext,
        service: &str,
        handler: Arc<dyn EventTestHandler<P, E, S>>,
    ) -> CommResult<Self> {
        let id = context.allocate_id();
        let address = ServiceAddress::new(context.component_name(), service);
        let (alive, alive_rx) = watch::channel(true);
        let clients = Arc::new(DashMap::new());
        let activations: ActivationList<P, E> = Arc::new(Mutex::new(Vec::new()));

        let activation_handler = handler.clone();
        let endpoint = Arc::new(EventEndpoint {
            activations: activations.clone(),
            on_activation: Arc::new(move |param: &P| activation_handler.on_activation(param)),
            clients: clients.clone(),
            alive: alive_rx,
        });
        context.naming().register_service(
            address.clone(),
            ServiceDescriptor::event::<P, E>(),
            endpoint,
        )?;

        info!(server = %address, id = %id, "Event server started");
        Ok(Self {
            id,
            address,
            context,
            handler,
            activations,
            clients,
            alive,
            fired: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Publish a new state and fire every activation it satisfies.
    ///
    /// Single activations are removed once they fired. Returns the number of
    /// events fired; after shutdown nothing fires.
    pub fn put(&self, state: &S) -> usize {
        if self.stopped.load(Ordering::SeqCst) {
            return 0;
        }

        let mut fired = 0;
        self.activations.lock().retain_mut(|activation| {
            let Some(event) = self.handler.test_event(&mut activation.param, state) else {
                return true;
            };
            if !activation.sink.deliver(activation.id, event) {
                return false;
            }
            fired += 1;
            activation.mode == EventMode::Continuous
        });

        if fired > 0 {
            self.fired.fetch_add(fired as u64, Ordering::Relaxed);
            trace!(server = %self.address, fired, "Events fired");
        }
        fired
    }

    /// Number of activations currently held
    pub fn activation_count(&self) -> usize {
        self.activations.lock().len()
    }

    /// Number of events fired so far
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Stop serving: unregister the port, disconnect clients and drop every
    /// activation. Idempotent.
    pub async fn shutdown(&self) -> CommResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.context.naming().unregister_service(&self.address);
        self.alive.send_replace(false);
        let dropped_clients = self.clients.len();
        self.clients.clear();
        self.activations.lock().clear();

        info!(server = %self.address, clients = dropped_clients, "Event server stopped");
        Ok(())
    }
}

impl<P: Payload, E: Payload, S: Send + Sync + 'static> ServerPattern for EventServer<P, E, S> {
    fn address(&self) -> &ServiceAddress {
        &self.address
    }

    fn server_id(&self) -> UniversalId {
        self.id
    }

    fn connected_clients(&self) -> Vec<UniversalId> {
        let mut clients: Vec<UniversalId> =
            self.clients.iter().map(|entry| *entry.key()).collect();
        clients.sort();
        clients
    }
}

#[async_trait]
impl<P: Payload, E: Payload, S: Send + Sync + 'static> ManagedPattern for EventServer<P, E, S> {
    fn describe(&self) -> String {
        format!("event-server {}", self.address)
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        self.shutdown().await
    }
}

impl<P: Payload, E: Payload, S: Send + Sync + 'static> Drop for EventServer<P, E, S> {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.context.naming().unregister_service(&self.address);
            self.alive.send_replace(false);
        }
    }
}
