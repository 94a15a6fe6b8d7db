//! Commkit Runtime
//!
//! This crate contains the executable side of the component model:
//! - `Component`: owner of patterns and tasks, and the single shutdown authority
//! - Push, query and event client/server patterns over an in-process transport
//! - `Task`: managed, cooperatively stoppable units of work
//! - `TimerManager`: one-shot and periodic timers owned by a component
//! - `NamingService`: `(component, service)` resolution with compatibility checks
//!
//! `commkit-core` provides the runtime-independent contracts these build on.

pub mod communication;
pub mod component;
pub mod event;
pub mod naming;
pub mod pattern;
pub mod push;
pub mod query;
pub mod task;
pub mod timer;

pub use communication::{Binding, CommunicationObject, Link};
pub use component::{Component, ComponentBuilder, ComponentContext, ComponentState, ShutdownReport};
pub use event::{
    event_handler_fn, event_test_fn, EventClient, EventHandler, EventHandlerAdapter, EventInput,
    EventMode, EventServer, EventStatus, EventTestHandler,
};
pub use naming::{InMemoryNamingService, NamingService, PatternKind, ServiceDescriptor};
pub use pattern::{BlockingControl, ClientPattern, ManagedPattern, ServerPattern};
pub use push::{PushClient, PushEnvelope, PushServer};
pub use query::{
    query_handler_fn, QueryClient, QueryHandlerAdapter, QueryServer, QueryServerHandler,
    QueryServerInput, QueryServerTaskTrigger, Responder,
};
pub use task::{
    task_fn, FnTask, InputTaskTrigger, Task, TaskBody, TaskFlow, TaskSchedule, TaskState,
    TaskTrigger,
};
pub use timer::{timer_handler_fn, TimerHandler, TimerId, TimerManager};

// Re-export core types for convenience
pub use commkit_core::{
    handler_fn, observer_fn, ActiveQueueDecorator, ActiveQueueStats, CommConfig, CommError,
    CommResult, ConnectionError, EventId, HandlerId, InputHandler, InputSubject, ObserverId,
    OverflowPolicy, Payload, QueryFailure, QueryId, QueueConfig, ServiceAddress,
    ShutdownObserver, UniversalId,
};
