//! Pattern capability traits
//!
//! Every pattern shares the connection capability set; push and query clients
//! add `send` and `query` on top of it. The component only knows its patterns as
//! [`ManagedPattern`]s so it can tear them down uniformly.

use std::fmt;

use async_trait::async_trait;
use commkit_core::{CommResult, ServiceAddress, UniversalId};
use tokio::sync::watch;
use tracing::warn;

// ----------------------------------------------------------------------------
// Capability Traits
// ----------------------------------------------------------------------------

/// Connection capabilities shared by all client patterns
#[async_trait]
pub trait ClientPattern: Send + Sync {
    /// Bind to a server's service port, releasing any current binding first
    async fn connect(&self, server: &str, service: &str) -> CommResult<()>;

    /// Release the current binding; a no-op when not connected
    async fn disconnect(&self) -> CommResult<()>;

    fn is_connected(&self) -> bool;

    /// Address of the current binding
    fn address(&self) -> Option<ServiceAddress>;

    /// Allow or cancel blocking calls on this client
    fn set_blocking(&self, blocking: bool);
}

/// Capabilities shared by all server patterns
pub trait ServerPattern: Send + Sync {
    fn address(&self) -> &ServiceAddress;

    fn server_id(&self) -> UniversalId;

    /// Ids of the clients currently bound to this server
    fn connected_clients(&self) -> Vec<UniversalId>;
}

/// Uniform teardown hook the component drives during shutdown
#[async_trait]
pub trait ManagedPattern: Send + Sync {
    /// Human-readable name for logs and shutdown reports
    fn describe(&self) -> String;

    /// Disconnect (clients) or stop serving (servers)
    async fn shutdown_pattern(&self) -> CommResult<()>;
}

// ----------------------------------------------------------------------------
// Blocking Control
// ----------------------------------------------------------------------------

/// Combined component-wide and per-client blocking switch
///
/// Blocking calls are allowed only while both switches are on. Turning either
/// one off wakes every waiting call, which then fails with `Cancelled`.
pub struct BlockingControl {
    component: watch::Receiver<bool>,
    local: watch::Sender<bool>,
}

impl BlockingControl {
    pub fn new(component: watch::Receiver<bool>) -> Self {
        let (local, _) = watch::channel(true);
        Self { component, local }
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.local.send_replace(blocking);
    }

    pub fn is_blocking(&self) -> bool {
        *self.component.borrow() && *self.local.borrow()
    }

    /// Resolves once blocking calls are no longer allowed
    pub async fn cancelled(&self) {
        let mut component = self.component.clone();
        let mut local = self.local.subscribe();
        loop {
            if !*component.borrow_and_update() || !*local.borrow_and_update() {
                return;
            }
            tokio::select! {
                Ok(()) = component.changed() => {}
                Ok(()) = local.changed() => {}
                else => std::future::pending::<()>().await,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Input Delivery
// ----------------------------------------------------------------------------

/// Run one delivery to user handlers on the blocking pool.
///
/// Handlers may sleep or wait on a full active queue; the receive task awaits the
/// result so items still reach the subject one at a time, in arrival order.
/// Returns `None` when the delivery panicked.
pub(crate) async fn deliver_blocking<D, F, R>(source: &D, deliver: F) -> Option<R>
where
    D: fmt::Display + ?Sized,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(deliver).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(source = %source, error = %e, "Input delivery failed");
            None
        }
    }
}
