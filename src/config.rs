use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RingError;

/// Per-node protocol configuration.
///
/// Every instance carries its own copy, so nodes in one process can run with
/// differing schedules (the integration tests rely on this). Loadable from a
/// JSON file via [`RingConfig::load`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Identifier bit width m; the ring is the space [0, 2^m).
    pub bits: u32,
    /// Successor-list length k (immediate successor included).
    pub successors: usize,
    /// How often each node runs the stabilize round.
    pub stabilize_interval: Duration,
    /// How often each node refreshes one finger-table entry.
    pub fix_fingers_interval: Duration,
    /// How often each node probes its predecessor.
    pub check_predecessor_interval: Duration,
    /// Connect + per-request bound on every outbound call.
    pub rpc_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            bits: 64,
            successors: 3,
            stabilize_interval: Duration::from_secs(1),
            fix_fingers_interval: Duration::from_millis(500),
            check_predecessor_interval: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

impl RingConfig {
    pub fn load(path: &Path) -> Result<Self, RingError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RingError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: RingConfig = serde_json::from_str(&raw)
            .map_err(|e| RingError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RingError> {
        if self.bits == 0 || self.bits > 64 {
            return Err(RingError::InvalidIdentifier(format!(
                "bit width must be in 1..=64, got {}",
                self.bits
            )));
        }
        if self.successors == 0 {
            return Err(RingError::Config(
                "successor list length must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
