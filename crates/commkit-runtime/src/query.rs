//! Query pattern
//!
//! Request/response between [`QueryClient`]s and one [`QueryServer`]. Every
//! request travels with a [`Responder`] that accepts exactly one answer; the
//! server delivers the request to its input subject, where a
//! [`QueryServerHandler`] (or any input handler, possibly behind an active
//! queue) answers it. A request that is dropped without an answer fails on the
//! client with `QueryFailed` instead of hanging.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commkit_core::{
    CommError, CommResult, HandlerId, InputHandler, InputSubject, Payload, QueryConfig,
    QueryFailure, QueryId, QueryIdGenerator, ServiceAddress, UniversalId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::communication::{Binding, CommunicationObject, Link};
use crate::component::ComponentContext;
use crate::naming::{resolve_endpoint, ServiceDescriptor};
use crate::pattern::{
    deliver_blocking, BlockingControl, ClientPattern, ManagedPattern, ServerPattern,
};
use crate::task::TaskTrigger;

type Answer<A> = Result<A, QueryFailure>;

// ----------------------------------------------------------------------------
// Responder
// ----------------------------------------------------------------------------

/// One-shot answer slot of a request; cloning shares the slot
pub struct Responder<A> {
    slot: Arc<Mutex<Option<oneshot::Sender<Answer<A>>>>>,
}

impl<A> Clone for Responder<A> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<A> Responder<A> {
    fn new(sender: oneshot::Sender<Answer<A>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        }
    }

    fn complete(&self, answer: Answer<A>) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            // A send error only means the client stopped waiting.
            Some(sender) => {
                let _ = sender.send(answer);
                true
            }
            None => false,
        }
    }

    /// Answer the request; returns false if it was already answered
    pub fn answer(&self, answer: A) -> bool {
        self.complete(Ok(answer))
    }

    /// Fail the request; returns false if it was already answered
    pub fn fail(&self, failure: QueryFailure) -> bool {
        self.complete(Err(failure))
    }

    pub fn is_answered(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// A request as seen by the server's input subject
pub struct QueryServerInput<R, A> {
    pub id: QueryId,
    pub client: UniversalId,
    pub request: R,
    pub responder: Responder<A>,
}

impl<R: Clone, A> Clone for QueryServerInput<R, A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            client: self.client,
            request: self.request.clone(),
            responder: self.responder.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Query Server Handler
// ----------------------------------------------------------------------------

/// Server-side per-request callback
pub trait QueryServerHandler<R, A>: Send + Sync {
    /// Produce the answer for one request
    fn handle_query(&self, request: &R) -> Result<A, QueryFailure>;
}

struct FnQueryHandler<F>(F);

impl<R, A, F> QueryServerHandler<R, A> for FnQueryHandler<F>
where
    F: Fn(&R) -> Result<A, QueryFailure> + Send + Sync,
{
    fn handle_query(&self, request: &R) -> Result<A, QueryFailure> {
        (self.0)(request)
    }
}

/// Wrap a closure as a query handler
pub fn query_handler_fn<R, A, F>(f: F) -> Arc<dyn QueryServerHandler<R, A>>
where
    R: 'static,
    A: 'static,
    F: Fn(&R) -> Result<A, QueryFailure> + Send + Sync + 'static,
{
    Arc::new(FnQueryHandler(f))
}

/// Input handler that answers each request through a [`QueryServerHandler`]
pub struct QueryHandlerAdapter<R, A> {
    handler: Arc<dyn QueryServerHandler<R, A>>,
    _marker: PhantomData<fn(R) -> A>,
}

impl<R, A> QueryHandlerAdapter<R, A> {
    pub fn new(handler: Arc<dyn QueryServerHandler<R, A>>) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<R: Payload, A: Send + 'static> InputHandler<QueryServerInput<R, A>>
    for QueryHandlerAdapter<R, A>
{
    fn handle_input(&self, input: &QueryServerInput<R, A>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle_query(&input.request)
        }));
        let answered = match outcome {
            Ok(Ok(answer)) => input.responder.answer(answer),
            Ok(Err(failure)) => {
                debug!(query = %input.id, error = %failure, "Query handler failed");
                input.responder.fail(failure)
            }
            Err(_) => {
                warn!(query = %input.id, "Query handler panicked");
                input
                    .responder
                    .fail(QueryFailure::Handler("query handler panicked".to_string()))
            }
        };
        if !answered {
            trace!(query = %input.id, "Query already answered");
        }
    }
}

/// Input handler that queues requests for a task instead of answering them.
///
/// Every request fires the trigger; the task body drains the queue with
/// [`QueryServerTaskTrigger::consume_request`] and answers through each
/// request's responder. Requests still queued when the handler is released are
/// dropped, so their clients see `QueryFailure::Dropped`.
pub struct QueryServerTaskTrigger<R, A> {
    trigger: TaskTrigger,
    queue: Mutex<VecDeque<QueryServerInput<R, A>>>,
}

impl<R, A> QueryServerTaskTrigger<R, A> {
    pub fn new(trigger: TaskTrigger) -> Self {
        Self {
            trigger,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest request not yet taken by the task
    pub fn consume_request(&self) -> Option<QueryServerInput<R, A>> {
        self.queue.lock().pop_front()
    }

    /// Number of queued requests
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl<R: Payload, A: Send + 'static> InputHandler<QueryServerInput<R, A>>
    for QueryServerTaskTrigger<R, A>
{
    fn handle_input(&self, input: &QueryServerInput<R, A>) {
        self.queue.lock().push_back(input.clone());
        self.trigger.trigger();
    }

    async fn release(&self) -> CommResult<()> {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "Queued requests dropped on release");
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-Process Link
// ----------------------------------------------------------------------------

/// Server endpoint published through the naming service
pub struct QueryEndpoint<R, A> {
    sender: mpsc::Sender<QueryServerInput<R, A>>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Receiver<bool>,
}

/// Client side of a query connection
pub struct QueryLink<R, A> {
    endpoint: Arc<QueryEndpoint<R, A>>,
    client: UniversalId,
}

impl<R, A> Clone for QueryLink<R, A> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            client: self.client,
        }
    }
}

impl<R: Payload, A: Send + 'static> Link for QueryLink<R, A> {
    fn is_closed(&self) -> bool {
        self.endpoint.sender.is_closed() || !*self.endpoint.alive.borrow()
    }

    fn release(&self) {
        self.endpoint.clients.remove(&self.client);
    }
}

impl<R, A> QueryLink<R, A> {
    /// Resolves once the server stops serving
    async fn server_gone(&self) {
        let mut alive = self.endpoint.alive.clone();
        // An error means the server itself is gone.
        let _ = alive.wait_for(|alive| !*alive).await;
    }
}

// ----------------------------------------------------------------------------
// Query Client
// ----------------------------------------------------------------------------

enum Wake<A> {
    Answer(Result<Answer<A>, oneshot::error::RecvError>),
    Timeout,
    Cancelled,
    Disconnected,
    ServerGone,
}

struct PendingQuery<A> {
    answer: tokio::sync::Mutex<oneshot::Receiver<Answer<A>>>,
}

/// Requesting side of the query pattern
pub struct QueryClient<R: Payload, A: Send + 'static> {
    id: UniversalId,
    context: ComponentContext,
    config: QueryConfig,
    comm: CommunicationObject<QueryLink<R, A>>,
    blocking: BlockingControl,
    ids: QueryIdGenerator,
    pending: Mutex<HashMap<QueryId, Arc<PendingQuery<A>>>>,
}

impl<R: Payload, A: Send + 'static> QueryClient<R, A> {
    pub(crate) fn new(context: ComponentContext) -> Self {
        let id = context.allocate_id();
        let label = format!("{}/query-client/{}", context.component_name(), id);
        Self {
            id,
            config: context.config().query.clone(),
            blocking: BlockingControl::new(context.blocking_receiver()),
            comm: CommunicationObject::new(label),
            ids: QueryIdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            context,
        }
    }

    pub fn id(&self) -> UniversalId {
        self.id
    }

    /// Number of requests awaiting collection
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn pending_query(&self, id: QueryId) -> CommResult<Arc<PendingQuery<A>>> {
        self.pending
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CommError::WrongId(id.value()))
    }

    fn forget(&self, id: QueryId) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Drop every pending request; their answers can no longer arrive
    fn abort_pending(&self, reason: &'static str) {
        let aborted = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if aborted > 0 {
            debug!(client = %self.id, aborted, reason, "Pending queries aborted");
        }
    }

    /// Current binding; losing it aborts every pending request
    fn binding(&self) -> CommResult<Binding<QueryLink<R, A>>> {
        self.comm.binding().map_err(|e| {
            self.abort_pending("not connected");
            e
        })
    }

    /// Current binding if the server still serves it; see [`CommunicationObject::live_binding`]
    async fn live_binding(&self) -> CommResult<Binding<QueryLink<R, A>>> {
        match self.comm.live_binding().await {
            Ok(binding) => Ok(binding),
            Err(e) => {
                self.abort_pending("server gone");
                Err(e)
            }
        }
    }

    /// Release a binding whose server went away, together with its pending requests
    async fn close_binding(&self, generation: u64) {
        if self.comm.disconnect_generation(generation).await {
            self.abort_pending("server gone");
        }
    }

    /// Send a request and return its correlation id without waiting
    pub async fn query_request(&self, request: R) -> CommResult<QueryId> {
        let bound = self.config.default_timeout();
        self.send_request(request, Instant::now() + bound, bound).await
    }

    /// Hand one request to the server's link, giving up at `deadline`
    async fn send_request(
        &self,
        request: R,
        deadline: Instant,
        bound: Duration,
    ) -> CommResult<QueryId> {
        let binding = self.live_binding().await?;
        let (sender, receiver) = oneshot::channel();
        let id = self.ids.next_id();
        let input = QueryServerInput {
            id,
            client: self.id,
            request,
            responder: Responder::new(sender),
        };

        let sent = tokio::select! {
            sent = tokio::time::timeout_at(deadline, binding.link.endpoint.sender.send(input)) => {
                sent
            }
            _ = self.blocking.cancelled() => return Err(CommError::Cancelled),
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.close_binding(binding.generation).await;
                return Err(CommError::NotConnected);
            }
            Err(_) => {
                debug!(client = %self.id, timeout_ms = bound.as_millis() as u64, "Query link congested");
                return Err(CommError::timeout("query request", bound));
            }
        }

        self.pending.lock().insert(
            id,
            Arc::new(PendingQuery {
                answer: tokio::sync::Mutex::new(receiver),
            }),
        );
        trace!(client = %self.id, query = %id, "Query sent");
        Ok(id)
    }

    /// Collect an answer if it has arrived; `None` while still outstanding
    pub fn query_receive(&self, id: QueryId) -> CommResult<Option<A>> {
        let pending = self.pending_query(id)?;
        let Ok(mut answer) = pending.answer.try_lock() else {
            return Ok(None);
        };

        match answer.try_recv() {
            Ok(result) => {
                drop(answer);
                self.forget(id);
                result.map(Some).map_err(CommError::from)
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => {
                drop(answer);
                self.forget(id);
                Err(QueryFailure::Dropped.into())
            }
        }
    }

    /// Wait up to `timeout` for the answer of a pending request.
    ///
    /// On timeout the request stays pending and can be waited for again or
    /// discarded.
    pub async fn query_receive_wait(&self, id: QueryId, timeout: Duration) -> CommResult<A> {
        self.wait_answer(id, Instant::now() + timeout, timeout).await
    }

    async fn wait_answer(&self, id: QueryId, deadline: Instant, bound: Duration) -> CommResult<A> {
        let pending = self.pending_query(id)?;
        let binding = self.binding()?;
        let mut connected = self.comm.subscribe();
        let disconnected = async move {
            let _ = connected.wait_for(|connected| !*connected).await;
        };

        let wake = {
            let mut answer = pending.answer.lock().await;
            tokio::select! {
                biased;
                result = &mut *answer => Wake::Answer(result),
                _ = tokio::time::sleep_until(deadline) => Wake::Timeout,
                _ = self.blocking.cancelled() => Wake::Cancelled,
                _ = disconnected => Wake::Disconnected,
                _ = binding.link.server_gone() => Wake::ServerGone,
            }
        };

        match wake {
            Wake::Answer(result) => {
                self.forget(id);
                match result {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(failure)) => Err(failure.into()),
                    Err(_) => Err(QueryFailure::Dropped.into()),
                }
            }
            Wake::Timeout => Err(CommError::timeout("query", bound)),
            Wake::Cancelled => Err(CommError::Cancelled),
            Wake::Disconnected => {
                self.abort_pending("disconnected");
                Err(CommError::NotConnected)
            }
            Wake::ServerGone => {
                self.close_binding(binding.generation).await;
                self.forget(id);
                Err(CommError::NotConnected)
            }
        }
    }

    /// Forget a pending request; its answer is discarded when it arrives
    pub fn query_discard(&self, id: QueryId) -> CommResult<()> {
        if self.forget(id) {
            trace!(client = %self.id, query = %id, "Query discarded");
            Ok(())
        } else {
            Err(CommError::WrongId(id.value()))
        }
    }

    /// Send a request and wait for its answer.
    ///
    /// `timeout` bounds the whole call, including time spent waiting for room on
    /// a congested link.
    pub async fn query(&self, request: R, timeout: Duration) -> CommResult<A> {
        if !self.blocking.is_blocking() {
            return Err(CommError::Cancelled);
        }
        let deadline = Instant::now() + timeout;
        let id = self.send_request(request, deadline, timeout).await?;
        let result = self.wait_answer(id, deadline, timeout).await;
        if result.is_err() {
            self.forget(id);
        }
        result
    }

    /// [`QueryClient::query`] with the configured default timeout
    pub async fn query_default(&self, request: R) -> CommResult<A> {
        self.query(request, self.config.default_timeout()).await
    }
}

#[async_trait]
impl<R: Payload, A: Send + 'static> ClientPattern for QueryClient<R, A> {
    async fn connect(&self, server: &str, service: &str) -> CommResult<()> {
        let naming = self.context.naming().clone();
        let client = self.id;
        let owner = self.context.component_name().to_string();
        self.comm
            .connect_with(ServiceAddress::new(server, service), |address| {
                let endpoint = resolve_endpoint::<QueryEndpoint<R, A>>(
                    naming.as_ref(),
                    address,
                    &ServiceDescriptor::query::<R, A>(),
                )?;
                if !*endpoint.alive.borrow() {
                    return Err(CommError::communication(format!("{address} is shutting down")));
                }
                endpoint.clients.insert(client, owner);
                Ok(QueryLink { endpoint, client })
            })
            .await?;
        Ok(())
    }

    /// Release the binding; every pending request fails with `NotConnected`
    async fn disconnect(&self) -> CommResult<()> {
        self.comm.disconnect().await?;
        self.abort_pending("disconnect");
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
impl<R: Payload, A: Send + 'static> ManagedPattern for QueryClient<R, A> {
    fn describe(&self) -> String {
        self.comm.label().to_string()
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        ClientPattern::disconnect(self).await
    }
}

// ----------------------------------------------------------------------------
// Query Server
// ----------------------------------------------------------------------------

/// Answering side of the query pattern
pub struct QueryServer<R: Payload, A: Send + 'static> {
    id: UniversalId,
    address: ServiceAddress,
    context: ComponentContext,
    subject: Arc<InputSubject<QueryServerInput<R, A>>>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Sender<bool>,
    received: Arc<AtomicU64>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<R: Payload, A: Send + 'static> QueryServer<R, A> {
    /// Register the service port and start the receive task
    pub(crate) fn new(context: ComponentContext, service: &str) -> CommResult<Self> {
        let id = context.allocate_id();
        let address = ServiceAddress::new(context.component_name(), service);
        let (sender, mut rx) = mpsc::channel::<QueryServerInput<R, A>>(
            context.config().query.channel_capacity,
        );
        let (alive, alive_rx) = watch::channel(true);
        let clients = Arc::new(DashMap::new());

        let endpoint = Arc::new(QueryEndpoint {
            sender,
            clients: clients.clone(),
            alive: alive_rx.clone(),
        });
        context.naming().register_service(
            address.clone(),
            ServiceDescriptor::query::<R, A>(),
            endpoint,
        )?;

        let subject = Arc::new(InputSubject::new(address.to_string()));
        let received = Arc::new(AtomicU64::new(0));

        let task_subject = subject.clone();
        let task_received = received.clone();
        let task_address = address.clone();
        let mut stop = alive_rx;
        let receiver = tokio::spawn(async move {
            debug!(server = %task_address, "Query receive task started");
            loop {
                tokio::select! {
                    input = rx.recv() => match input {
                        Some(input) => {
                            task_received.fetch_add(1, Ordering::Relaxed);
                            let subject = task_subject.clone();
                            let responder = input.responder.clone();
                            let delivered =
                                deliver_blocking(&task_address, move || subject.notify(&input)).await;
                            match delivered {
                                Some(true) => {}
                                Some(false) => {
                                    responder.fail(QueryFailure::NoHandler);
                                }
                                None => {
                                    responder.fail(QueryFailure::Handler(
                                        "query delivery panicked".to_string(),
                                    ));
                                }
                            }
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
            debug!(server = %task_address, "Query receive task stopped");
        });

        info!(server = %address, id = %id, "Query server started");
        Ok(Self {
            id,
            address,
            context,
            subject,
            clients,
            alive,
            received,
            receiver: Mutex::new(Some(receiver)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Subject every received request is delivered to
    pub fn subject(&self) -> &Arc<InputSubject<QueryServerInput<R, A>>> {
        &self.subject
    }

    /// Register a query handler answering every request
    pub fn register_handler(&self, handler: Arc<dyn QueryServerHandler<R, A>>) -> HandlerId {
        self.subject
            .register(Arc::new(QueryHandlerAdapter::new(handler)))
    }

    /// Number of requests received so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop serving; requests still queued fail on their clients. Idempotent.
    pub async fn shutdown(&self) -> CommResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.context.naming().unregister_service(&self.address);
        self.alive.send_replace(false);
        let dropped_clients = self.clients.len();
        self.clients.clear();

        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                warn!(server = %self.address, error = %e, "Query receive task ended abnormally");
            }
        }

        self.subject.clear().await?;
        info!(server = %self.address, clients = dropped_clients, "Query server stopped");
        Ok(())
    }
}

impl<R: Payload, A: Send + 'static> ServerPattern for QueryServer<R, A> {
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
impl<R: Payload, A: Send + 'static> ManagedPattern for QueryServer<R, A> {
    fn describe(&self) -> String {
        format!("query-server {}", self.address)
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        self.shutdown().await
    }
}

impl<R: Payload, A: Send + 'static> Drop for QueryServer<R, A> {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.context.naming().unregister_service(&self.address);
            self.alive.send_replace(false);
        }
    }
}
