//! Centralized Configuration Management
//!
//! All tunables of the pattern layer live here so a component can be configured from
//! a single serde-friendly structure (the CLI loads it from TOML).

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{CommError, Result};

// ----------------------------------------------------------------------------
// Active Queue Configuration
// ----------------------------------------------------------------------------

/// What an active queue does with an item that arrives while its buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Block the notifying thread until space frees up (bounded by `block_timeout_ms`,
    /// after which the item is rejected)
    Block,
    /// Evict the oldest buffered item to make room
    DropOldest,
    /// Discard the arriving item
    RejectNew,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::RejectNew => "reject-new",
        };
        f.write_str(name)
    }
}

/// Configuration of an active-queue input handler decorator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of buffered items
    pub capacity: usize,
    /// Behavior when the buffer is full
    pub overflow: OverflowPolicy,
    /// Upper bound on a blocked producer under `OverflowPolicy::Block`
    pub block_timeout_ms: u64,
    /// Upper bound on joining the worker thread during deregistration
    pub stop_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            overflow: OverflowPolicy::Block,
            block_timeout_ms: 1_000,
            stop_timeout_ms: 2_000,
        }
    }
}

impl QueueConfig {
    /// Shorthand for a queue with the given capacity and policy
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow,
            ..Self::default()
        }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Pattern Configuration
// ----------------------------------------------------------------------------

/// Push pattern tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Buffer of the in-process link between clients and one server
    pub channel_capacity: usize,
    /// Upper bound on `send` when the link is congested
    pub send_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            send_timeout_ms: 500,
        }
    }
}

impl PushConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Query pattern tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Buffer of the in-process request link of one server
    pub channel_capacity: usize,
    /// Timeout applied by `QueryClient::query_default`
    pub default_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
            default_timeout_ms: 1_000,
        }
    }
}

impl QueryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Lifecycle Configuration
// ----------------------------------------------------------------------------

/// Task tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Stop timeout applied to every task during component shutdown
    pub stop_timeout_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 2_000,
        }
    }
}

impl TaskConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Component shutdown tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on a single observer's `on_shutdown`
    pub observer_timeout_ms: u64,
    /// Whether `run_until_shutdown` also reacts to Ctrl-C
    pub handle_ctrl_c: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            observer_timeout_ms: 1_000,
            handle_ctrl_c: true,
        }
    }
}

impl ShutdownConfig {
    pub fn observer_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of one component's pattern layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub queue: QueueConfig,
    pub push: PushConfig,
    pub query: QueryConfig,
    pub task: TaskConfig,
    pub shutdown: ShutdownConfig,
}

impl CommConfig {
    /// Short timeouts and small buffers for tests
    pub fn testing() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 16,
                overflow: OverflowPolicy::Block,
                block_timeout_ms: 200,
                stop_timeout_ms: 500,
            },
            push: PushConfig {
                channel_capacity: 64,
                send_timeout_ms: 100,
            },
            query: QueryConfig {
                channel_capacity: 32,
                default_timeout_ms: 200,
            },
            task: TaskConfig {
                stop_timeout_ms: 200,
            },
            shutdown: ShutdownConfig {
                observer_timeout_ms: 200,
                handle_ctrl_c: false,
            },
        }
    }

    /// Drop stale data rather than block producers
    pub fn low_latency() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 8,
                overflow: OverflowPolicy::DropOldest,
                ..QueueConfig::default()
            },
            push: PushConfig {
                channel_capacity: 32,
                send_timeout_ms: 20,
            },
            ..Self::default()
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(CommError::config_error("queue.capacity must be at least 1"));
        }
        if self.push.channel_capacity == 0 {
            return Err(CommError::config_error(
                "push.channel_capacity must be at least 1",
            ));
        }
        if self.query.channel_capacity == 0 {
            return Err(CommError::config_error(
                "query.channel_capacity must be at least 1",
            ));
        }
        if self.query.default_timeout_ms == 0 {
            return Err(CommError::config_error(
                "query.default_timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(CommConfig::default().validate().is_ok());
        assert!(CommConfig::testing().validate().is_ok());
        assert!(CommConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = CommConfig::default();
        config.queue.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(CommError::Configuration { .. })
        ));
    }

    #[test]
    fn test_overflow_policy_names() {
        assert_eq!(OverflowPolicy::DropOldest.to_string(), "drop-oldest");
        assert_eq!(OverflowPolicy::RejectNew.to_string(), "reject-new");
    }
}
