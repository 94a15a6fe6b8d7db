//! Push pattern
//!
//! Fire-and-forget streaming from any number of [`PushClient`]s to one
//! [`PushServer`]. Each server owns a bounded in-process link; a receive task
//! forwards every item to the server's [`InputSubject`]. Items from one client
//! arrive in send order; there is no ordering across clients.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use commkit_core::{
    CommError, CommResult, HandlerId, InputHandler, InputSubject, Payload, PushConfig,
    ServiceAddress, UniversalId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::communication::{CommunicationObject, Link};
use crate::component::ComponentContext;
use crate::naming::{resolve_endpoint, ServiceDescriptor};
use crate::pattern::{
    deliver_blocking, BlockingControl, ClientPattern, ManagedPattern, ServerPattern,
};

// ----------------------------------------------------------------------------
// In-Process Link
// ----------------------------------------------------------------------------

/// One pushed item tagged with its sender
#[derive(Debug, Clone)]
pub struct PushEnvelope<T> {
    pub client: UniversalId,
    pub data: T,
}

/// Server endpoint published through the naming service
pub struct PushEndpoint<T> {
    sender: mpsc::Sender<PushEnvelope<T>>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Receiver<bool>,
}

/// Client side of a push connection
pub struct PushLink<T> {
    endpoint: Arc<PushEndpoint<T>>,
    client: UniversalId,
}

impl<T> Clone for PushLink<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            client: self.client,
        }
    }
}

impl<T: Payload> Link for PushLink<T> {
    fn is_closed(&self) -> bool {
        self.endpoint.sender.is_closed() || !*self.endpoint.alive.borrow()
    }

    fn release(&self) {
        self.endpoint.clients.remove(&self.client);
    }
}

// ----------------------------------------------------------------------------
// Push Client
// ----------------------------------------------------------------------------

/// Sending side of the push pattern
pub struct PushClient<T: Payload> {
    id: UniversalId,
    context: ComponentContext,
    config: PushConfig,
    comm: CommunicationObject<PushLink<T>>,
    blocking: BlockingControl,
}

impl<T: Payload> PushClient<T> {
    pub(crate) fn new(context: ComponentContext) -> Self {
        let id = context.allocate_id();
        let label = format!("{}/push-client/{}", context.component_name(), id);
        Self {
            id,
            config: context.config().push.clone(),
            blocking: BlockingControl::new(context.blocking_receiver()),
            comm: CommunicationObject::new(label),
            context,
        }
    }

    pub fn id(&self) -> UniversalId {
        self.id
    }

    /// Transmit one item to the bound server.
    ///
    /// Fails with `NotConnected` when unbound or when the server went away, and
    /// with `Timeout` when the link stays congested for `send_timeout_ms`.
    pub async fn send(&self, data: T) -> CommResult<()> {
        let binding = self.comm.live_binding().await?;
        let envelope = PushEnvelope {
            client: self.id,
            data,
        };

        let timeout = self.config.send_timeout();
        let result = tokio::select! {
            result = binding.link.endpoint.sender.send_timeout(envelope, timeout) => result,
            _ = self.blocking.cancelled() => return Err(CommError::Cancelled),
        };

        match result {
            Ok(()) => {
                trace!(client = %self.id, "Pushed item");
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(client = %self.id, "Push server closed the link");
                self.comm.disconnect_generation(binding.generation).await;
                Err(CommError::NotConnected)
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(client = %self.id, timeout_ms = timeout.as_millis() as u64, "Push send timed out");
                Err(CommError::timeout("push send", timeout))
            }
        }
    }
}

#[async_trait]
impl<T: Payload> ClientPattern for PushClient<T> {
    async fn connect(&self, server: &str, service: &str) -> CommResult<()> {
        let naming = self.context.naming().clone();
        let client = self.id;
        let owner = self.context.component_name().to_string();
        self.comm
            .connect_with(ServiceAddress::new(server, service), |address| {
                let endpoint = resolve_endpoint::<PushEndpoint<T>>(
                    naming.as_ref(),
                    address,
                    &ServiceDescriptor::push::<T>(),
                )?;
                if !*endpoint.alive.borrow() {
                    return Err(CommError::communication(format!("{address} is shutting down")));
                }
                endpoint.clients.insert(client, owner);
                Ok(PushLink { endpoint, client })
            })
            .await
    }

    async fn disconnect(&self) -> CommResult<()> {
        self.comm.disconnect().await
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
impl<T: Payload> ManagedPattern for PushClient<T> {
    fn describe(&self) -> String {
        self.comm.label().to_string()
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        self.comm.disconnect().await
    }
}

// ----------------------------------------------------------------------------
// Push Server
// ----------------------------------------------------------------------------

/// Receiving side of the push pattern
pub struct PushServer<T: Payload> {
    id: UniversalId,
    address: ServiceAddress,
    context: ComponentContext,
    subject: Arc<InputSubject<T>>,
    clients: Arc<DashMap<UniversalId, String>>,
    alive: watch::Sender<bool>,
    received: Arc<AtomicU64>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<T: Payload> PushServer<T> {
    /// Register the service port and start the receive task
    pub(crate) fn new(context: ComponentContext, service: &str) -> CommResult<Self> {
        let id = context.allocate_id();
        let address = ServiceAddress::new(context.component_name(), service);
        let (sender, mut rx) = mpsc::channel(context.config().push.channel_capacity);
        let (alive, alive_rx) = watch::channel(true);
        let clients = Arc::new(DashMap::new());

        let endpoint = Arc::new(PushEndpoint {
            sender,
            clients: clients.clone(),
            alive: alive_rx.clone(),
        });
        context
            .naming()
            .register_service(address.clone(), ServiceDescriptor::push::<T>(), endpoint)?;

        let subject = Arc::new(InputSubject::new(address.to_string()));
        let received = Arc::new(AtomicU64::new(0));

        let task_subject = subject.clone();
        let task_received = received.clone();
        let task_address = address.clone();
        let mut stop = alive_rx;
        let receiver = tokio::spawn(async move {
            debug!(server = %task_address, "Push receive task started");
            loop {
                tokio::select! {
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => {
                            task_received.fetch_add(1, Ordering::Relaxed);
                            let client = envelope.client;
                            let subject = task_subject.clone();
                            let delivered =
                                deliver_blocking(&task_address, move || subject.notify(&envelope.data))
                                    .await;
                            if delivered == Some(false) {
                                trace!(server = %task_address, client = %client, "Push item without handlers");
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
            debug!(server = %task_address, "Push receive task stopped");
        });

        info!(server = %address, id = %id, "Push server started");
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

    /// Subject every received item is delivered to
    pub fn subject(&self) -> &Arc<InputSubject<T>> {
        &self.subject
    }

    /// Shorthand for registering a handler on [`PushServer::subject`]
    pub fn register_handler(&self, handler: Arc<dyn InputHandler<T>>) -> HandlerId {
        self.subject.register(handler)
    }

    /// Number of items received so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop serving: unregister the port, disconnect clients, stop the receive
    /// task and release every registered handler. Idempotent.
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
                warn!(server = %self.address, error = %e, "Push receive task ended abnormally");
            }
        }

        self.subject.clear().await?;
        info!(server = %self.address, clients = dropped_clients, "Push server stopped");
        Ok(())
    }
}

impl<T: Payload> ServerPattern for PushServer<T> {
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
impl<T: Payload> ManagedPattern for PushServer<T> {
    fn describe(&self) -> String {
        format!("push-server {}", self.address)
    }

    async fn shutdown_pattern(&self) -> CommResult<()> {
        self.shutdown().await
    }
}

impl<T: Payload> Drop for PushServer<T> {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.context.naming().unregister_service(&self.address);
            self.alive.send_replace(false);
        }
    }
}
