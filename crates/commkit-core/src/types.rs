//! Core identifier and addressing types
//!
//! Newtypes for the identifiers that flow through the patterns: globally unique
//! [`UniversalId`]s for entities, client-local [`QueryId`] correlation tokens, and
//! the `(server, service)` [`ServiceAddress`] a client binds to.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CommError;

// ----------------------------------------------------------------------------
// Universal Identifier
// ----------------------------------------------------------------------------

/// Globally unique, opaque, totally ordered identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniversalId(Uuid);

impl UniversalId {
    /// Allocate a new random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The nil identifier, never handed out by an allocator
    pub const NIL: Self = Self(Uuid::nil());
}

impl Default for UniversalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UniversalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniversalId {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CommError::config_error(format!("invalid universal id '{s}': {e}")))
    }
}

// ----------------------------------------------------------------------------
// Identifier Allocation
// ----------------------------------------------------------------------------

/// Source of fresh universal identifiers
pub trait IdAllocator: Send + Sync {
    /// Produce an identifier never returned before by this allocator
    fn allocate(&self) -> UniversalId;
}

/// Allocator backed by random v4 UUIDs
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdAllocator;

impl IdAllocator for RandomIdAllocator {
    fn allocate(&self) -> UniversalId {
        UniversalId::new()
    }
}

/// Monotonic allocator for deterministic tests
///
/// Identifiers compare in allocation order.
#[derive(Debug)]
pub struct SequentialIdAllocator {
    next: AtomicU64,
}

impl SequentialIdAllocator {
    /// Create an allocator whose first identifier is `1`
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an allocator starting at a specific value
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator for SequentialIdAllocator {
    fn allocate(&self) -> UniversalId {
        let value = self.next.fetch_add(1, Ordering::SeqCst);
        UniversalId(Uuid::from_u128(value as u128))
    }
}

// ----------------------------------------------------------------------------
// Query Correlation
// ----------------------------------------------------------------------------

/// Client-local correlation token matching a query answer to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Hands out increasing query ids for one client
#[derive(Debug, Default)]
pub struct QueryIdGenerator {
    next: AtomicU64,
}

impl QueryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> QueryId {
        QueryId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ----------------------------------------------------------------------------
// Event Activations
// ----------------------------------------------------------------------------

/// Client-local handle of one event activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(u64);

impl EventId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Service Addressing
// ----------------------------------------------------------------------------

/// Named remote endpoint: the server component and one of its service ports
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub server: String,
    pub service: String,
}

impl ServiceAddress {
    pub fn new<S: Into<String>, V: Into<String>>(server: S, service: V) -> Self {
        Self {
            server: server.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.service)
    }
}
