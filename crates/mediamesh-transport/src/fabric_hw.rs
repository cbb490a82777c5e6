//! Hardware RDMA fabric via libfabric.
//!
//! Placeholder provider — real hardware support requires an RDMA-capable
//! NIC and the libfabric userspace stack. Deployments without hardware use
//! [`crate::fabric_sim::SimFabric`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::fabric::{FabricDevice, FabricProvider};

/// Hardware fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwFabricConfig {
    /// Fabric provider name passed to libfabric (e.g. "verbs").
    pub provider: String,
    /// Maximum memory-region size in bytes.
    pub max_mr_size: usize,
}

impl Default for HwFabricConfig {
    fn default() -> Self {
        Self {
            provider: "verbs".to_string(),
            max_mr_size: 64 * 1024 * 1024,
        }
    }
}

/// Hardware fabric provider (not yet implemented).
pub struct HwFabric {
    _config: HwFabricConfig,
}

impl HwFabric {
    /// Create the hardware provider. Currently always returns an error.
    pub fn new(_config: HwFabricConfig) -> Result<Arc<Self>> {
        Err(TransportError::InitializationFailed {
            reason: "hardware RDMA support not yet implemented".to_string(),
        })
    }

    /// Whether RDMA hardware is available on this system.
    pub fn is_available() -> bool {
        false
    }
}

impl FabricProvider for HwFabric {
    fn device_init(&self, _dev_port: &str) -> Result<Arc<dyn FabricDevice>> {
        Err(TransportError::InitializationFailed {
            reason: "hardware RDMA support not yet implemented".to_string(),
        })
    }
}
