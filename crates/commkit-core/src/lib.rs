//! Commkit Core Contracts
//!
//! This crate provides the runtime-independent building blocks of the component
//! communication patterns: identifiers and addressing, the error taxonomy, the
//! configuration model, the input subject / input handler observer pair with its
//! active-queue decorator, and the one-shot shutdown broadcast. The patterns,
//! tasks and the component aggregate live in `commkit-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod active_queue;
pub mod config;
pub mod errors;
pub mod input;
pub mod prescale;
pub mod shutdown;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use active_queue::{ActiveQueueDecorator, ActiveQueueStats};
pub use config::{
    CommConfig, OverflowPolicy, PushConfig, QueryConfig, QueueConfig, ShutdownConfig,
    TaskConfig,
};
pub use errors::{CommError, CommResult, ConnectionError, QueryFailure, Result};
pub use input::{handler_fn, FnHandler, HandlerId, InputHandler, InputSubject, Payload};
pub use prescale::PrescaleManager;
pub use shutdown::{
    observer_fn, FnObserver, ObserverId, ShutdownObserver, ShutdownOutcome, ShutdownSubject,
};
pub use types::{
    EventId, IdAllocator, QueryId, QueryIdGenerator, RandomIdAllocator, SequentialIdAllocator,
    ServiceAddress, UniversalId,
};
