//! Verbs-style fabric façade.
//!
//! The traits here are the only place fabric handles live. Connections talk
//! to a [`FabricProvider`] to bring up a device, to a [`FabricDevice`] to
//! create endpoints, and to a [`FabricEndpoint`] to register memory, post
//! work and read completions. Provider implementations map their native
//! error numbers into the crate error taxonomy before they surface here.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Maximum completions drained in a single `cq_read` call.
pub const CQ_BATCH_SIZE: usize = 64;

/// Default bounded timeout for completion-queue reads. Every blocking loop
/// in the workers is bounded by this, so cancellation is observed within
/// one poll interval.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Opaque handle to a fabric-registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(
    /// Provider-assigned registration id.
    pub u64,
);

/// One work completion read from a completion queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CqEvent {
    /// Caller-chosen work-request id, echoed back on completion. The
    /// connection core uses the buffer index.
    pub wr_id: u64,
    /// Bytes transferred by the completed operation.
    pub len: u32,
}

/// Direction of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Sends buffers to the remote address.
    Transmit,
    /// Receives into posted buffers.
    Receive,
}

/// Parameters for endpoint creation.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transmit or receive.
    pub role: EndpointRole,
    /// Local `ip:port`.
    pub local: String,
    /// Remote `ip:port`.
    pub remote: String,
    /// Size of each pre-registered buffer, in bytes.
    pub buffer_size: usize,
    /// Number of buffers; bounds the in-flight operation count.
    pub queue_depth: usize,
}

/// Entry point of a fabric implementation.
///
/// `device_init` is reference-counted by the provider: repeated calls with
/// the same `dev_port` return the same device handle while one is alive.
pub trait FabricProvider: Send + Sync {
    /// Open (or re-use) the device behind `dev_port`.
    fn device_init(&self, dev_port: &str) -> Result<Arc<dyn FabricDevice>>;
}

/// An open fabric device.
pub trait FabricDevice: Send + Sync {
    /// Create an endpoint on this device.
    fn endpoint_init(&self, cfg: &EndpointConfig) -> Result<Arc<dyn FabricEndpoint>>;
}

/// An open endpoint. Owned exclusively by one connection; destroyed during
/// that connection's shutdown.
pub trait FabricEndpoint: Send + Sync {
    /// Register `len` bytes at `addr` for fabric access.
    fn register_memory(&self, addr: u64, len: usize) -> Result<MrHandle>;

    /// Release a memory registration.
    fn unregister_memory(&self, mr: MrHandle) -> Result<()>;

    /// Post a receive buffer. `wr_id` is echoed in the matching completion.
    fn post_recv(&self, wr_id: u64, addr: u64, len: u32, mr: MrHandle) -> Result<()>;

    /// Post a send of `len` bytes from `addr`. Returns once the post is
    /// accepted, not once it completes.
    fn post_send(&self, wr_id: u64, addr: u64, len: u32, mr: MrHandle) -> Result<()>;

    /// Read up to `events.len()` completions, blocking at most `timeout`.
    /// `Ok(0)` means the timeout expired with nothing to read.
    fn cq_read(&self, events: &mut [CqEvent], timeout: Duration) -> Result<usize>;

    /// Tear the endpoint down. Idempotent; posted work is discarded and
    /// subsequent posts fail with `ConnClosed`.
    fn destroy(&self);
}
