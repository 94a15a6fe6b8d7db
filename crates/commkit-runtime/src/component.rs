//! Component aggregate
//!
//! A [`Component`] is the top-level addressable unit. It owns its patterns and
//! tasks, holds the one lifecycle state, and is the only party that can shut
//! them down. Shutdown is coordinated and idempotent:
//!
//! ```text
//! Created -> Running -> ShuttingDown -> Shutdown
//! ```
//!
//! The first `shutdown()` cancels blocking calls, stops every task, cancels the
//! component's timers and tears down every pattern before it broadcasts to the
//! shutdown observers. Failures along
//! the way are collected in the [`ShutdownReport`] instead of aborting the
//! sequence; later calls return immediately.

use std::fmt;
use std::sync::{Arc, Weak};

use commkit_core::{
    CommConfig, CommError, CommResult, IdAllocator, ObserverId, Payload, RandomIdAllocator,
    ServiceAddress, ShutdownObserver, ShutdownSubject, UniversalId,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::event::{EventClient, EventServer, EventTestHandler};
use crate::naming::{InMemoryNamingService, NamingService};
use crate::pattern::{ClientPattern, ManagedPattern};
use crate::push::{PushClient, PushServer};
use crate::query::{QueryClient, QueryServer};
use crate::task::{Task, TaskBody, TaskSchedule, TaskState};
use crate::timer::TimerManager;

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

/// Component lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Created => "created",
            ComponentState::Running => "running",
            ComponentState::ShuttingDown => "shutting-down",
            ComponentState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// What happened during a shutdown call
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub component: String,
    /// False for calls that found the component already shut down
    pub performed: bool,
    pub tasks_stopped: usize,
    pub timers_cancelled: usize,
    pub patterns_closed: usize,
    pub observers_notified: usize,
    pub task_failures: Vec<(String, CommError)>,
    pub pattern_failures: Vec<(String, CommError)>,
    pub observer_timeouts: Vec<ObserverId>,
}

impl ShutdownReport {
    /// Whether every step completed without failure
    pub fn is_clean(&self) -> bool {
        self.task_failures.is_empty()
            && self.pattern_failures.is_empty()
            && self.observer_timeouts.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Component Builder
// ----------------------------------------------------------------------------

/// Builder for [`Component`]
pub struct ComponentBuilder {
    name: String,
    config: CommConfig,
    naming: Option<Arc<dyn NamingService>>,
    ids: Option<Arc<dyn IdAllocator>>,
}

impl ComponentBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            config: CommConfig::default(),
            naming: None,
            ids: None,
        }
    }

    /// Set the pattern-layer configuration
    pub fn with_config(mut self, config: CommConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a naming service with other components (defaults to a private one)
    pub fn with_naming(mut self, naming: Arc<dyn NamingService>) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Use a specific id allocator (defaults to random v4 ids)
    pub fn with_id_allocator(mut self, ids: Arc<dyn IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validate the configuration and register the component name
    pub fn build(self) -> CommResult<Component> {
        if self.name.is_empty() {
            return Err(CommError::config_error("component name must not be empty"));
        }
        self.config.validate()?;

        let naming = self.naming.unwrap_or_else(InMemoryNamingService::shared);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(RandomIdAllocator) as Arc<dyn IdAllocator>);
        let id = ids.allocate();
        naming.register_component(&self.name, id)?;

        let (blocking, _) = watch::channel(true);
        info!(component = %self.name, id = %id, "Component created");

        Ok(Component {
            inner: Arc::new(ComponentInner {
                shutdown_subject: ShutdownSubject::new(self.name.clone()),
                timers: TimerManager::new(self.name.clone()),
                name: self.name,
                id,
                config: self.config,
                naming,
                ids,
                owned: Mutex::new(Owned {
                    state: ComponentState::Created,
                    tasks: Vec::new(),
                    patterns: Vec::new(),
                }),
                blocking,
                shutdown_requested: Notify::new(),
                shutdown_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

// ----------------------------------------------------------------------------
// Component
// ----------------------------------------------------------------------------

/// Lifecycle state and everything shutdown must reach, guarded together
struct Owned {
    state: ComponentState,
    tasks: Vec<Arc<Task>>,
    patterns: Vec<Arc<dyn ManagedPattern>>,
}

impl Owned {
    fn ensure_open(&self, component: &str) -> CommResult<()> {
        match self.state {
            ComponentState::ShuttingDown | ComponentState::Shutdown => {
                Err(CommError::already_shutdown(component.to_string()))
            }
            _ => Ok(()),
        }
    }
}

struct ComponentInner {
    name: String,
    id: UniversalId,
    config: CommConfig,
    naming: Arc<dyn NamingService>,
    ids: Arc<dyn IdAllocator>,
    owned: Mutex<Owned>,
    timers: TimerManager,
    shutdown_subject: ShutdownSubject,
    blocking: watch::Sender<bool>,
    shutdown_requested: Notify,
    shutdown_lock: tokio::sync::Mutex<()>,
}

/// Shared handle to a component
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    pub fn builder<S: Into<String>>(name: S) -> ComponentBuilder {
        ComponentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> UniversalId {
        self.inner.id
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    pub fn naming(&self) -> &Arc<dyn NamingService> {
        &self.inner.naming
    }

    pub fn state(&self) -> ComponentState {
        self.inner.owned.lock().state
    }

    fn context(&self) -> ComponentContext {
        ComponentContext {
            component: Arc::downgrade(&self.inner),
            name: self.inner.name.clone(),
            naming: self.inner.naming.clone(),
            config: self.inner.config.clone(),
            ids: self.inner.ids.clone(),
            blocking: self.inner.blocking.subscribe(),
        }
    }

    /// Create a pattern and take ownership of it.
    ///
    /// The open check and the registration happen under the lock shutdown takes
    /// its snapshot under, so every adopted pattern is torn down by shutdown.
    fn adopt<P, F>(&self, create: F) -> CommResult<Arc<P>>
    where
        P: ManagedPattern + 'static,
        F: FnOnce(ComponentContext) -> CommResult<P>,
    {
        let context = self.context();
        let mut owned = self.inner.owned.lock();
        owned.ensure_open(&self.inner.name)?;
        let pattern = Arc::new(create(context)?);
        debug!(component = %self.inner.name, pattern = %pattern.describe(), "Pattern added");
        owned.patterns.push(pattern.clone());
        Ok(pattern)
    }

    /// Enter `Running` and start every task that has not started yet
    pub fn start(&self) -> CommResult<()> {
        let tasks = {
            let mut owned = self.inner.owned.lock();
            match owned.state {
                ComponentState::Running => return Ok(()),
                ComponentState::ShuttingDown | ComponentState::Shutdown => {
                    return Err(CommError::already_shutdown(self.inner.name.clone()))
                }
                ComponentState::Created => owned.state = ComponentState::Running,
            }
            owned.tasks.clone()
        };

        for task in tasks.iter().filter(|task| task.state() == TaskState::Created) {
            task.start()?;
        }
        info!(component = %self.inner.name, tasks = tasks.len(), "Component running");
        Ok(())
    }

    /// Allow or cancel blocking calls on every client of this component
    pub fn set_blocking(&self, blocking: bool) {
        self.inner.blocking.send_replace(blocking);
        debug!(component = %self.inner.name, blocking, "Blocking mode changed");
    }

    // ------------------------------------------------------------------------
    // Pattern Factories
    // ------------------------------------------------------------------------

    /// Create an unbound push client
    pub fn push_client<T: Payload>(&self) -> CommResult<Arc<PushClient<T>>> {
        self.adopt(|context| Ok(PushClient::new(context)))
    }

    /// Create a push client bound to `server/service`
    pub async fn connected_push_client<T: Payload>(
        &self,
        server: &str,
        service: &str,
    ) -> CommResult<Arc<PushClient<T>>> {
        let client = self.push_client::<T>()?;
        client.connect(server, service).await?;
        Ok(client)
    }

    /// Offer a push service named `service`
    pub fn push_server<T: Payload>(&self, service: &str) -> CommResult<Arc<PushServer<T>>> {
        self.adopt(|context| PushServer::new(context, service))
    }

    /// Create an unbound query client
    pub fn query_client<R: Payload, A: Send + 'static>(
        &self,
    ) -> CommResult<Arc<QueryClient<R, A>>> {
        self.adopt(|context| Ok(QueryClient::new(context)))
    }

    /// Create a query client bound to `server/service`
    pub async fn connected_query_client<R: Payload, A: Send + 'static>(
        &self,
        server: &str,
        service: &str,
    ) -> CommResult<Arc<QueryClient<R, A>>> {
        let client = self.query_client::<R, A>()?;
        client.connect(server, service).await?;
        Ok(client)
    }

    /// Offer a query service named `service`
    pub fn query_server<R: Payload, A: Send + 'static>(
        &self,
        service: &str,
    ) -> CommResult<Arc<QueryServer<R, A>>> {
        self.adopt(|context| QueryServer::new(context, service))
    }

    /// Create an unbound event client
    pub fn event_client<P: Payload, E: Payload>(&self) -> CommResult<Arc<EventClient<P, E>>> {
        self.adopt(|context| Ok(EventClient::new(context)))
    }

    /// Create an event client bound to `server/service`
    pub async fn connected_event_client<P: Payload, E: Payload>(
        &self,
        server: &str,
        service: &str,
    ) -> CommResult<Arc<EventClient<P, E>>> {
        let client = self.event_client::<P, E>()?;
        client.connect(server, service).await?;
        Ok(client)
    }

    /// Offer an event service named `service`, fired through `handler`
    pub fn event_server<P, E, S>(
        &self,
        service: &str,
        handler: Arc<dyn EventTestHandler<P, E, S>>,
    ) -> CommResult<Arc<EventServer<P, E, S>>>
    where
        P: Payload,
        E: Payload,
        S: Send + Sync + 'static,
    {
        self.adopt(|context| EventServer::new(context, service, handler))
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Create a task owned by this component.
    ///
    /// Tasks created before `start()` are started with the component; tasks
    /// created later must be started explicitly.
    pub fn create_task<S, B>(&self, name: S, schedule: TaskSchedule, body: B) -> CommResult<Arc<Task>>
    where
        S: Into<String>,
        B: TaskBody,
    {
        let mut owned = self.inner.owned.lock();
        owned.ensure_open(&self.inner.name)?;
        let task = Arc::new(Task::new(name, self.inner.ids.allocate(), schedule, body));
        debug!(component = %self.inner.name, task = %task.name(), "Task created");
        owned.tasks.push(task.clone());
        Ok(task)
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner.owned.lock().tasks.clone()
    }

    pub fn pattern_count(&self) -> usize {
        self.inner.owned.lock().patterns.len()
    }

    /// Timers of this component; all are cancelled on shutdown
    pub fn timers(&self) -> &TimerManager {
        &self.inner.timers
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Attach a shutdown observer; fails with `AlreadyShutdown` after shutdown
    pub fn register_shutdown_observer(
        &self,
        observer: Arc<dyn ShutdownObserver>,
    ) -> CommResult<ObserverId> {
        self.inner.shutdown_subject.attach(observer)
    }

    pub fn deregister_shutdown_observer(&self, id: ObserverId) -> bool {
        self.inner.shutdown_subject.detach(id)
    }

    /// Ask a pending [`Component::run_until_shutdown`] to shut down
    pub fn request_shutdown(&self) {
        info!(component = %self.inner.name, "Shutdown requested");
        self.inner.shutdown_requested.notify_one();
    }

    /// Shut the component down; only the first call does the work.
    pub async fn shutdown(&self) -> CommResult<ShutdownReport> {
        let _serialized = self.inner.shutdown_lock.lock().await;
        let mut report = ShutdownReport {
            component: self.inner.name.clone(),
            ..ShutdownReport::default()
        };

        // Nothing can be adopted once the state flips, so the snapshot is complete.
        let (tasks, patterns) = {
            let mut owned = self.inner.owned.lock();
            if owned.state == ComponentState::Shutdown {
                return Ok(report);
            }
            owned.state = ComponentState::ShuttingDown;
            (owned.tasks.clone(), owned.patterns.clone())
        };
        report.performed = true;
        info!(component = %self.inner.name, "Component shutting down");

        self.inner.blocking.send_replace(false);

        let stop_timeout = self.inner.config.task.stop_timeout();
        let stops = join_all(tasks.iter().map(|task| task.stop(stop_timeout))).await;
        for (task, result) in tasks.iter().zip(stops) {
            match result {
                Ok(()) => report.tasks_stopped += 1,
                Err(e) => {
                    warn!(component = %self.inner.name, task = %task.name(), error = %e, "Task stop failed");
                    report.task_failures.push((task.name().to_string(), e));
                }
            }
        }

        report.timers_cancelled = self.inner.timers.close();

        for pattern in &patterns {
            match pattern.shutdown_pattern().await {
                Ok(()) => report.patterns_closed += 1,
                Err(e) => {
                    error!(component = %self.inner.name, pattern = %pattern.describe(), error = %e, "Pattern shutdown failed");
                    report.pattern_failures.push((pattern.describe(), e));
                }
            }
        }

        let outcome = self
            .inner
            .shutdown_subject
            .notify_shutdown(self.inner.config.shutdown.observer_timeout())
            .await;
        report.observers_notified = outcome.notified;
        report.observer_timeouts = outcome.timed_out;

        self.inner.naming.unregister_component(&self.inner.name);
        self.inner.owned.lock().state = ComponentState::Shutdown;
        self.inner.shutdown_requested.notify_waiters();

        info!(
            component = %self.inner.name,
            tasks = report.tasks_stopped,
            timers = report.timers_cancelled,
            patterns = report.patterns_closed,
            observers = report.observers_notified,
            clean = report.is_clean(),
            "Component shut down"
        );
        Ok(report)
    }

    /// Wait for [`Component::request_shutdown`] (or Ctrl-C when enabled) and
    /// then shut down.
    pub async fn run_until_shutdown(&self) -> CommResult<ShutdownReport> {
        if self.state() == ComponentState::Created {
            self.start()?;
        }

        if self.state() == ComponentState::Running {
            if self.inner.config.shutdown.handle_ctrl_c {
                tokio::select! {
                    _ = self.inner.shutdown_requested.notified() => {}
                    signal = tokio::signal::ctrl_c() => {
                        if let Err(e) = signal {
                            warn!(component = %self.inner.name, error = %e, "Ctrl-C handler unavailable");
                        } else {
                            info!(component = %self.inner.name, "Ctrl-C received");
                        }
                    }
                }
            } else {
                self.inner.shutdown_requested.notified().await;
            }
        }

        self.shutdown().await
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Pattern Context
// ----------------------------------------------------------------------------

/// What a pattern needs from its owning component
///
/// Holds only a weak reference to the component itself; the component owns
/// its patterns, never the other way around.
#[derive(Clone)]
pub struct ComponentContext {
    component: Weak<ComponentInner>,
    name: String,
    naming: Arc<dyn NamingService>,
    config: CommConfig,
    ids: Arc<dyn IdAllocator>,
    blocking: watch::Receiver<bool>,
}

impl ComponentContext {
    pub fn component_name(&self) -> &str {
        &self.name
    }

    pub fn naming(&self) -> &Arc<dyn NamingService> {
        &self.naming
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn allocate_id(&self) -> UniversalId {
        self.ids.allocate()
    }

    pub fn blocking_receiver(&self) -> watch::Receiver<bool> {
        self.blocking.clone()
    }

    /// The owning component, if it still exists
    pub fn component(&self) -> Option<Component> {
        self.component.upgrade().map(|inner| Component { inner })
    }

    /// Address of a service offered by the owning component
    pub fn service_address(&self, service: &str) -> ServiceAddress {
        ServiceAddress::new(self.name.clone(), service)
    }
}
