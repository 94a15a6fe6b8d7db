//! Commkit CLI Configuration Management
//!
//! The CLI reads an optional TOML file laid over the defaults. Every section and key
//! may be omitted:
//!
//! ```toml
//! [demo]
//! server = "base"
//! client = "planner"
//!
//! [comm.queue]
//! capacity = 8
//! overflow = "drop-oldest"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use commkit_core::CommConfig;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Names used by the demonstration scenarios
    pub demo: DemoConfig,

    /// Pattern-layer configuration shared by both components
    pub comm: CommConfig,
}

/// Component and service names of the scenarios
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Component that hosts the servers
    pub server: String,
    /// Component that hosts the clients
    pub client: String,
    /// Service name of the query scenario
    pub query_service: String,
    /// Service name of the push scenario
    pub push_service: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            server: "base".to_string(),
            client: "planner".to_string(),
            query_service: "ping".to_string(),
            push_service: "samples".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Loading and Validation
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Parse a TOML document over the defaults and validate the result
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file; errors name the file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml_str(&source)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Render the effective configuration
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.comm.validate()?;
        if self.demo.server.is_empty() || self.demo.client.is_empty() {
            return Err(CliError::Config(
                "demo.server and demo.client must be non-empty".to_string(),
            ));
        }
        if self.demo.server == self.demo.client {
            return Err(CliError::Config(format!(
                "demo.server and demo.client must differ (both are '{}')",
                self.demo.server
            )));
        }
        Ok(())
    }
}
