//! Service naming
//!
//! Servers register the endpoint of each service port under its
//! `(component, service)` address; clients resolve that address when they
//! connect. Resolution checks that the client's pattern kind and payload types
//! match what the server offers, so a push client can never bind to a query
//! server, or to a push server carrying a different payload type.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use commkit_core::{CommError, CommResult, ConnectionError, ServiceAddress, UniversalId};
use dashmap::DashMap;
use tracing::debug;

// ----------------------------------------------------------------------------
// Service Descriptors
// ----------------------------------------------------------------------------

/// Communication pattern offered by a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Push,
    Query,
    Event,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Push => f.write_str("push"),
            PatternKind::Query => f.write_str("query"),
            PatternKind::Event => f.write_str("event"),
        }
    }
}

/// Pattern kind plus the payload type names a port carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub kind: PatternKind,
    pub payload_types: Vec<&'static str>,
}

impl ServiceDescriptor {
    pub fn push<T: 'static>() -> Self {
        Self {
            kind: PatternKind::Push,
            payload_types: vec![type_name::<T>()],
        }
    }

    pub fn query<R: 'static, A: 'static>() -> Self {
        Self {
            kind: PatternKind::Query,
            payload_types: vec![type_name::<R>(), type_name::<A>()],
        }
    }

    /// Event port carrying activation parameters `P` and events `E`
    pub fn event<P: 'static, E: 'static>() -> Self {
        Self {
            kind: PatternKind::Event,
            payload_types: vec![type_name::<P>(), type_name::<E>()],
        }
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.kind, self.payload_types.join(", "))
    }
}

/// Type-erased server endpoint stored in the registry
pub type Endpoint = Arc<dyn Any + Send + Sync>;

// ----------------------------------------------------------------------------
// Naming Service Trait
// ----------------------------------------------------------------------------

/// Resolution of service addresses to server endpoints
pub trait NamingService: Send + Sync {
    /// Announce a component so its name resolves even before it offers services
    fn register_component(&self, name: &str, id: UniversalId) -> CommResult<()>;

    /// Forget a component and every service it registered
    fn unregister_component(&self, name: &str);

    /// Register a server port; fails with `PortAlreadyUsed` on collision
    fn register_service(
        &self,
        address: ServiceAddress,
        descriptor: ServiceDescriptor,
        endpoint: Endpoint,
    ) -> Result<(), ConnectionError>;

    /// Remove a server port; returns whether it was registered
    fn unregister_service(&self, address: &ServiceAddress) -> bool;

    /// Find the endpoint registered under `address` if it matches `expected`
    fn resolve(
        &self,
        address: &ServiceAddress,
        expected: &ServiceDescriptor,
    ) -> Result<Endpoint, ConnectionError>;

    /// Every registered service address
    fn services(&self) -> Vec<ServiceAddress>;
}

/// Resolve an address and downcast the endpoint to its concrete type
pub fn resolve_endpoint<E: Any + Send + Sync>(
    naming: &dyn NamingService,
    address: &ServiceAddress,
    expected: &ServiceDescriptor,
) -> CommResult<Arc<E>> {
    let endpoint = naming.resolve(address, expected)?;
    endpoint.downcast::<E>().map_err(|_| {
        CommError::Connection(ConnectionError::IncompatibleService {
            server: address.server.clone(),
            service: address.service.clone(),
            expected: expected.to_string(),
            actual: "foreign endpoint type".to_string(),
        })
    })
}

// ----------------------------------------------------------------------------
// In-Memory Naming Service
// ----------------------------------------------------------------------------

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    endpoint: Endpoint,
}

/// Process-local naming service shared by components of one process
#[derive(Default)]
pub struct InMemoryNamingService {
    components: DashMap<String, UniversalId>,
    services: DashMap<ServiceAddress, ServiceEntry>,
}

impl InMemoryNamingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the shared trait object
    pub fn shared() -> Arc<dyn NamingService> {
        Arc::new(Self::new())
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

impl NamingService for InMemoryNamingService {
    fn register_component(&self, name: &str, id: UniversalId) -> CommResult<()> {
        match self.components.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CommError::invalid_state(format!(
                "component name '{name}' is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
                debug!(component = %name, id = %id, "Component registered with naming service");
                Ok(())
            }
        }
    }

    fn unregister_component(&self, name: &str) {
        self.components.remove(name);
        self.services.retain(|address, _| address.server != name);
        debug!(component = %name, "Component unregistered from naming service");
    }

    fn register_service(
        &self,
        address: ServiceAddress,
        descriptor: ServiceDescriptor,
        endpoint: Endpoint,
    ) -> Result<(), ConnectionError> {
        match self.services.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ConnectionError::PortAlreadyUsed {
                server: address.server,
                service: address.service,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(address = %address, descriptor = %descriptor, "Service registered");
                slot.insert(ServiceEntry {
                    descriptor,
                    endpoint,
                });
                Ok(())
            }
        }
    }

    fn unregister_service(&self, address: &ServiceAddress) -> bool {
        let removed = self.services.remove(address).is_some();
        if removed {
            debug!(address = %address, "Service unregistered");
        }
        removed
    }

    fn resolve(
        &self,
        address: &ServiceAddress,
        expected: &ServiceDescriptor,
    ) -> Result<Endpoint, ConnectionError> {
        let Some(entry) = self.services.get(address) else {
            let server_known = self.components.contains_key(&address.server)
                || self
                    .services
                    .iter()
                    .any(|entry| entry.key().server == address.server);
            return Err(if server_known {
                ConnectionError::ServiceUnavailable {
                    server: address.server.clone(),
                    service: address.service.clone(),
                }
            } else {
                ConnectionError::UnknownComponent {
                    server: address.server.clone(),
                }
            });
        };

        if entry.descriptor != *expected {
            return Err(ConnectionError::IncompatibleService {
                server: address.server.clone(),
                service: address.service.clone(),
                expected: expected.to_string(),
                actual: entry.descriptor.to_string(),
            });
        }

        Ok(entry.endpoint.clone())
    }

    fn services(&self) -> Vec<ServiceAddress> {
        let mut addresses: Vec<ServiceAddress> =
            self.services.iter().map(|entry| entry.key().clone()).collect();
        addresses.sort();
        addresses
    }
}

impl fmt::Debug for InMemoryNamingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNamingService")
            .field("components", &self.components.len())
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(value: u32) -> Endpoint {
        Arc::new(value)
    }

    #[test]
    fn test_resolve_registered_service() {
        let naming = InMemoryNamingService::new();
        let address = ServiceAddress::new("base", "odometry");
        naming
            .register_service(address.clone(), ServiceDescriptor::push::<u32>(), endpoint(7))
            .unwrap();

        let resolved =
            resolve_endpoint::<u32>(&naming, &address, &ServiceDescriptor::push::<u32>()).unwrap();
        assert_eq!(*resolved, 7);
    }

    #[test]
    fn test_unknown_component_and_missing_service() {
        let naming = InMemoryNamingService::new();
        naming
            .register_component("base", UniversalId::new())
            .unwrap();

        let missing = naming.resolve(
            &ServiceAddress::new("base", "odometry"),
            &ServiceDescriptor::push::<u32>(),
        );
        assert!(matches!(
            missing,
            Err(ConnectionError::ServiceUnavailable { .. })
        ));

        let unknown = naming.resolve(
            &ServiceAddress::new("arm", "joints"),
            &ServiceDescriptor::push::<u32>(),
        );
        assert!(matches!(
            unknown,
            Err(ConnectionError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn test_incompatible_pattern_or_payload() {
        let naming = InMemoryNamingService::new();
        let address = ServiceAddress::new("base", "odometry");
        naming
            .register_service(address.clone(), ServiceDescriptor::push::<u32>(), endpoint(1))
            .unwrap();

        let wrong_kind = naming.resolve(&address, &ServiceDescriptor::query::<u32, u32>());
        assert!(matches!(
            wrong_kind,
            Err(ConnectionError::IncompatibleService { .. })
        ));

        let wrong_type = naming.resolve(&address, &ServiceDescriptor::push::<String>());
        assert!(matches!(
            wrong_type,
            Err(ConnectionError::IncompatibleService { .. })
        ));

        let event = naming.resolve(&address, &ServiceDescriptor::event::<u32, u32>());
        assert!(matches!(
            event,
            Err(ConnectionError::IncompatibleService { .. })
        ));
    }

    #[test]
    fn test_port_collision() {
        let naming = InMemoryNamingService::new();
        let address = ServiceAddress::new("base", "odometry");
        naming
            .register_service(address.clone(), ServiceDescriptor::push::<u32>(), endpoint(1))
            .unwrap();

        let collision =
            naming.register_service(address.clone(), ServiceDescriptor::push::<u32>(), endpoint(2));
        assert!(matches!(
            collision,
            Err(ConnectionError::PortAlreadyUsed { .. })
        ));

        assert!(naming.unregister_service(&address));
        assert!(!naming.unregister_service(&address));
        assert!(naming.services().is_empty());
    }

    #[test]
    fn test_unregister_component_drops_its_services() {
        let naming = InMemoryNamingService::new();
        naming.register_component("base", UniversalId::new()).unwrap();
        naming
            .register_service(
                ServiceAddress::new("base", "odometry"),
                ServiceDescriptor::push::<u32>(),
                endpoint(1),
            )
            .unwrap();
        assert!(naming.register_component("base", UniversalId::new()).is_err());

        naming.unregister_component("base");
        assert!(naming.services().is_empty());
        assert_eq!(naming.component_count(), 0);
    }
}
