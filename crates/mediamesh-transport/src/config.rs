//! Connection configuration for the RDMA transport variant.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Maximum payload per buffer: 1 GiB.
pub const MAX_TRANSFER_SIZE: u32 = 1 << 30;

/// Maximum number of buffers in a pool.
pub const MAX_QUEUE_DEPTH: u32 = 1024;

/// Default number of buffers in a pool.
pub const DEFAULT_QUEUE_DEPTH: u32 = 32;

fn default_queue_depth() -> u32 {
    DEFAULT_QUEUE_DEPTH
}

/// Configuration of one RDMA connection.
///
/// `transfer_size` bounds the payload carried by a single post;
/// `queue_depth` equals the number of pre-registered buffers and therefore
/// the maximum number of in-flight operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaConnectionConfig {
    /// Local data-plane IP address.
    pub local_ip: String,
    /// Local data-plane port.
    pub local_port: u16,
    /// Remote data-plane IP address.
    pub remote_ip: String,
    /// Remote data-plane port.
    pub remote_port: u16,
    /// Maximum payload per buffer, in bytes.
    pub transfer_size: u32,
    /// Number of buffers in the pool, in `[1, 1024]`.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
}

impl RdmaConnectionConfig {
    /// Validate the configuration. Called before any side effect of
    /// `configure`.
    pub fn validate(&self) -> Result<()> {
        if self.local_ip.is_empty() {
            return Err(TransportError::bad_argument("local_ip is empty"));
        }
        if self.remote_ip.is_empty() {
            return Err(TransportError::bad_argument("remote_ip is empty"));
        }
        if self.transfer_size == 0 {
            return Err(TransportError::bad_argument("transfer_size is zero"));
        }
        if self.transfer_size > MAX_TRANSFER_SIZE {
            return Err(TransportError::bad_argument(format!(
                "transfer_size {} exceeds maximum {}",
                self.transfer_size, MAX_TRANSFER_SIZE
            )));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(TransportError::bad_argument(format!(
                "queue_depth {} outside [1, {}]",
                self.queue_depth, MAX_QUEUE_DEPTH
            )));
        }
        Ok(())
    }

    /// Local address as `ip:port`.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// Remote address as `ip:port`.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RdmaConnectionConfig {
        RdmaConnectionConfig {
            local_ip: "192.168.1.10".to_string(),
            local_port: 8001,
            remote_ip: "192.168.1.20".to_string(),
            remote_port: 8002,
            transfer_size: 1024,
            queue_depth: 8,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_zero_transfer_size_rejected() {
        let mut cfg = valid_config();
        cfg.transfer_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(TransportError::BadArgument { .. })
        ));
    }

    #[test]
    fn test_max_transfer_size_accepted() {
        let mut cfg = valid_config();
        cfg.transfer_size = MAX_TRANSFER_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_oversized_transfer_rejected() {
        let mut cfg = valid_config();
        cfg.transfer_size = MAX_TRANSFER_SIZE + 1;
        assert!(matches!(
            cfg.validate(),
            Err(TransportError::BadArgument { .. })
        ));
    }

    #[test]
    fn test_queue_depth_bounds() {
        let mut cfg = valid_config();
        cfg.queue_depth = 0;
        assert!(cfg.validate().is_err());
        cfg.queue_depth = 1;
        assert!(cfg.validate().is_ok());
        cfg.queue_depth = MAX_QUEUE_DEPTH;
        assert!(cfg.validate().is_ok());
        cfg.queue_depth = MAX_QUEUE_DEPTH + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_ip_rejected() {
        let mut cfg = valid_config();
        cfg.local_ip.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_addr_formatting() {
        let cfg = valid_config();
        assert_eq!(cfg.local_addr(), "192.168.1.10:8001");
        assert_eq!(cfg.remote_addr(), "192.168.1.20:8002");
    }

    #[test]
    fn test_queue_depth_defaults_from_serde() {
        let cfg: RdmaConnectionConfig = serde_json::from_str(
            r#"{"local_ip":"a","local_port":1,"remote_ip":"b","remote_port":2,"transfer_size":64}"#,
        )
        .unwrap();
        assert_eq!(cfg.queue_depth, DEFAULT_QUEUE_DEPTH);
    }
}
