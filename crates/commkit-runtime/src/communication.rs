//! Communication object
//!
//! The endpoint handle of one client/server relationship. It owns the binding to
//! a remote service (the address plus the transport link) and serializes
//! connect/disconnect transitions so no half-connected state is ever visible.

use std::sync::atomic::{AtomicU64, Ordering};

use commkit_core::{CommError, CommResult, ServiceAddress};
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Transport Link
// ----------------------------------------------------------------------------

/// Client side of an in-process transport connection
pub trait Link: Clone + Send + Sync + 'static {
    /// Whether the remote end has gone away
    fn is_closed(&self) -> bool;

    /// Called once when the binding holding this link is released
    fn release(&self) {}
}

/// An established binding
#[derive(Debug, Clone)]
pub struct Binding<L> {
    pub address: ServiceAddress,
    pub link: L,
    /// Distinguishes this binding from earlier and later ones of the same object
    pub generation: u64,
}

// ----------------------------------------------------------------------------
// Communication Object
// ----------------------------------------------------------------------------

/// Connection state and addressing of one pattern endpoint
pub struct CommunicationObject<L: Link> {
    label: String,
    transition: Mutex<()>,
    binding: RwLock<Option<Binding<L>>>,
    generations: AtomicU64,
    connected: watch::Sender<bool>,
}

impl<L: Link> CommunicationObject<L> {
    pub fn new<S: Into<String>>(label: S) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            label: label.into(),
            transition: Mutex::new(()),
            binding: RwLock::new(None),
            generations: AtomicU64::new(0),
            connected,
        }
    }

    /// Bind to `address`, using `resolve` to establish the link.
    ///
    /// An existing binding is released first. If resolution fails the object is
    /// left disconnected and the error is returned to the caller.
    pub async fn connect_with<F>(&self, address: ServiceAddress, resolve: F) -> CommResult<()>
    where
        F: FnOnce(&ServiceAddress) -> CommResult<L>,
    {
        let _transition = self.transition.lock().await;
        self.release_binding();

        let link = resolve(&address).map_err(|e| {
            debug!(endpoint = %self.label, address = %address, error = %e, "Connect failed");
            e
        })?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        *self.binding.write() = Some(Binding {
            address: address.clone(),
            link,
            generation,
        });
        self.connected.send_replace(true);
        info!(endpoint = %self.label, address = %address, "Connected");
        Ok(())
    }

    /// Release the binding; a no-op when not connected
    pub async fn disconnect(&self) -> CommResult<()> {
        let _transition = self.transition.lock().await;
        self.release_binding();
        Ok(())
    }

    /// Release the binding only if it is still the one with `generation`.
    ///
    /// Returns whether it was released. A binding established after the caller
    /// observed `generation` is left alone.
    pub async fn disconnect_generation(&self, generation: u64) -> bool {
        let _transition = self.transition.lock().await;
        let current = self.binding.read().as_ref().map(|b| b.generation);
        if current != Some(generation) {
            return false;
        }
        self.release_binding();
        true
    }

    fn release_binding(&self) {
        let previous = self.binding.write().take();
        if let Some(binding) = previous {
            binding.link.release();
            self.connected.send_replace(false);
            info!(endpoint = %self.label, address = %binding.address, "Disconnected");
        }
    }

    /// Current binding, or `NotConnected`
    pub fn binding(&self) -> CommResult<Binding<L>> {
        self.binding.read().clone().ok_or(CommError::NotConnected)
    }

    /// Current link, or `NotConnected`
    pub fn link(&self) -> CommResult<L> {
        self.binding().map(|binding| binding.link)
    }

    /// Current binding if its link is still usable.
    ///
    /// A binding whose remote end went away is released here, so the caller sees
    /// `NotConnected` and the object reports disconnected afterwards. A binding
    /// that replaced the stale one in the meantime survives.
    pub async fn live_binding(&self) -> CommResult<Binding<L>> {
        let binding = self.binding()?;
        if binding.link.is_closed() {
            self.disconnect_generation(binding.generation).await;
            return Err(CommError::NotConnected);
        }
        Ok(binding)
    }

    pub async fn live_link(&self) -> CommResult<L> {
        self.live_binding().await.map(|binding| binding.link)
    }

    pub fn address(&self) -> Option<ServiceAddress> {
        self.binding
            .read()
            .as_ref()
            .map(|binding| binding.address.clone())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connected flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<L: Link> Drop for CommunicationObject<L> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.link.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct TestLink {
        closed: Arc<AtomicBool>,
        released: Arc<AtomicUsize>,
    }

    impl Link for TestLink {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let object = CommunicationObject::new("test");
        let link = TestLink::default();
        let address = ServiceAddress::new("server", "service");

        assert!(matches!(object.link(), Err(CommError::NotConnected)));
        object
            .connect_with(address.clone(), |_| Ok(link.clone()))
            .await
            .unwrap();
        assert!(object.is_connected());
        assert_eq!(object.address(), Some(address));

        object.disconnect().await.unwrap();
        object.disconnect().await.unwrap();
        assert!(!object.is_connected());
        assert_eq!(link.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_disconnected() {
        let object: CommunicationObject<TestLink> = CommunicationObject::new("test");
        let first = TestLink::default();
        object
            .connect_with(ServiceAddress::new("a", "b"), |_| Ok(first.clone()))
            .await
            .unwrap();

        let result = object
            .connect_with(ServiceAddress::new("c", "d"), |_| {
                Err(CommError::communication("unreachable"))
            })
            .await;

        assert!(result.is_err());
        assert!(!object.is_connected());
        assert!(object.address().is_none());
        assert_eq!(first.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_link_reports_not_connected() {
        let object = CommunicationObject::new("test");
        let link = TestLink::default();
        object
            .connect_with(ServiceAddress::new("a", "b"), |_| Ok(link.clone()))
            .await
            .unwrap();

        link.closed.store(true, Ordering::SeqCst);
        assert!(matches!(
            object.live_link().await,
            Err(CommError::NotConnected)
        ));
        assert!(!object.is_connected());
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_binding() {
        let object = CommunicationObject::new("test");
        let stale = TestLink::default();
        object
            .connect_with(ServiceAddress::new("a", "b"), |_| Ok(stale.clone()))
            .await
            .unwrap();
        let observed = object.binding().unwrap();
        stale.closed.store(true, Ordering::SeqCst);

        // Reconnected between observing the closed link and releasing it.
        let fresh = TestLink::default();
        object
            .connect_with(ServiceAddress::new("a", "b"), |_| Ok(fresh.clone()))
            .await
            .unwrap();

        assert!(!object.disconnect_generation(observed.generation).await);
        assert!(object.is_connected());
        assert_eq!(fresh.released.load(Ordering::SeqCst), 0);
        assert!(object.live_link().await.is_ok());

        let current = object.binding().unwrap().generation;
        assert!(current > observed.generation);
        assert!(object.disconnect_generation(current).await);
        assert!(!object.is_connected());
    }
}
