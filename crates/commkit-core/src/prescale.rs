//! Update-rate division for input handlers
//!
//! A handler registered with prescale factor `n` only sees every n-th input of its
//! subject. The first due update is the n-th one after registration.

use crate::errors::{CommError, Result};

/// Divides an update frequency by a whole-numbered factor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrescaleManager {
    factor: u32,
    counter: u32,
}

impl PrescaleManager {
    /// Create a manager for the given factor (must be at least 1)
    pub fn new(factor: u32) -> Result<Self> {
        if factor == 0 {
            return Err(CommError::config_error("prescale factor must be at least 1"));
        }
        Ok(Self { factor, counter: 1 })
    }

    /// Manager that lets every update through
    pub fn every_update() -> Self {
        Self {
            factor: 1,
            counter: 1,
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Count one update and report whether it should be delivered
    pub fn is_update_due(&mut self) -> bool {
        if self.counter >= self.factor {
            self.counter = 1;
            true
        } else {
            self.counter += 1;
            false
        }
    }
}

impl Default for PrescaleManager {
    fn default() -> Self {
        Self::every_update()
    }
}
