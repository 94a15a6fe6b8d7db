//! Error types for the communication pattern core
//!
//! Every fallible operation of the patterns, tasks and the component returns a
//! [`CommError`]. Connection failures carry a [`ConnectionError`] describing why
//! an endpoint could not be bound, and failed queries carry a [`QueryFailure`].

use std::time::Duration;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Reasons an endpoint could not be bound (or registered)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unknown component '{server}'")]
    UnknownComponent { server: String },
    #[error("Service '{service}' is not offered by '{server}'")]
    ServiceUnavailable { server: String, service: String },
    #[error("Service '{server}/{service}' is incompatible: expected {expected}, found {actual}")]
    IncompatibleService {
        server: String,
        service: String,
        expected: String,
        actual: String,
    },
    #[error("Port '{server}/{service}' is already in use")]
    PortAlreadyUsed { server: String, service: String },
    #[error("Communication failure: {reason}")]
    Communication { reason: String },
}

/// Why a query did not produce an answer on the server side
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryFailure {
    #[error("Query handler failed: {0}")]
    Handler(String),
    #[error("No query handler registered")]
    NoHandler,
    #[error("Request dropped before an answer was produced")]
    Dropped,
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for communication patterns, tasks and components
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    /// Operation attempted without a bound endpoint
    #[error("Not connected")]
    NotConnected,

    /// Resolution or transport failure during connect
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A bounded wait expired
    #[error("Operation '{operation}' timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Server-side failure surfaced to the waiting client
    #[error("Query failed: {0}")]
    QueryFailed(#[from] QueryFailure),

    /// Cooperative task stop did not complete in time
    #[error("Task '{task}' did not stop within {}ms", .timeout.as_millis())]
    TaskStopTimeout { task: String, timeout: Duration },

    /// Operation attempted after terminal shutdown
    #[error("Component '{component}' is already shut down")]
    AlreadyShutdown { component: String },

    /// Blocking calls are disabled
    #[error("Blocking call cancelled")]
    Cancelled,

    /// No pending query, event activation or timer with this id
    #[error("Unknown query, activation or timer id {0}")]
    WrongId(u64),

    /// A single-mode event activation already handed out its one event
    #[error("Event activation {0} already delivered its event")]
    EventConsumed(u64),

    /// The event activation was deactivated while a caller waited on it
    #[error("Event activation {0} was deactivated")]
    NotActivated(u64),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CommError {
    /// Create a timeout error for the named operation
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        CommError::Timeout { operation, after }
    }

    /// Create a communication failure
    pub fn communication<T: Into<String>>(reason: T) -> Self {
        CommError::Connection(ConnectionError::Communication {
            reason: reason.into(),
        })
    }

    /// Create an invalid state error with a reason
    pub fn invalid_state<T: Into<String>>(reason: T) -> Self {
        CommError::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CommError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an already-shutdown error for a component
    pub fn already_shutdown<T: Into<String>>(component: T) -> Self {
        CommError::AlreadyShutdown {
            component: component.into(),
        }
    }

    /// Create a failed-query error from a handler message
    pub fn query_failed<T: Into<String>>(reason: T) -> Self {
        CommError::QueryFailed(QueryFailure::Handler(reason.into()))
    }

    /// Whether this error came out of a bounded wait
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CommError::Timeout { .. } | CommError::TaskStopTimeout { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, CommError>;
pub type CommResult<T> = Result<T>;
