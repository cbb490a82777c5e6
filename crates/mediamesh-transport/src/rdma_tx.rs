//! RDMA transmit connection.
//!
//! `transmit` runs on the caller's thread: it takes a buffer from the pool
//! (blocking, cancellation-aware), copies the payload in and posts a send,
//! returning once the post is accepted. A single completion-reaper worker
//! releases buffers as their sends complete; with every buffer in flight
//! the next `transmit` waits until a completion frees one, so the pool is
//! the only admission control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::buffer::{BufferPool, BufferPoolStats};
use crate::config::RdmaConnectionConfig;
use crate::connection::{Connection, ConnectionCore, Kind, State};
use crate::context::{CancelHandle, Context};
use crate::error::{Result, TransportError};
use crate::fabric::{
    CqEvent, EndpointRole, FabricEndpoint, FabricProvider, CQ_BATCH_SIZE, DEFAULT_POLL_TIMEOUT,
};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::rdma::{RdmaCore, RdmaSetup};

/// Transmitter half of an RDMA connection pair.
pub struct RdmaTx {
    core: ConnectionCore,
    rdma: RdmaCore,
    metrics: Arc<TransportMetrics>,
}

impl RdmaTx {
    /// Create an unconfigured transmit connection.
    pub fn new() -> Arc<Self> {
        Arc::new(RdmaTx {
            core: ConnectionCore::new(Kind::Transmitter),
            rdma: RdmaCore::new(),
            metrics: Arc::new(TransportMetrics::new()),
        })
    }

    /// Validate and store the connection parameters.
    /// Legal only in `not_configured`.
    pub fn configure(
        &self,
        _ctx: &Context,
        cfg: RdmaConnectionConfig,
        dev_port: &str,
        provider: Arc<dyn FabricProvider>,
    ) -> Result<()> {
        if self.core.state() != State::NotConfigured {
            return Err(TransportError::wrong_state("configure", self.core.state()));
        }
        cfg.validate()?;
        self.rdma.store_setup(RdmaSetup {
            cfg,
            dev_port: dev_port.to_string(),
            provider,
        });
        self.core.set_state(State::Configured);
        Ok(())
    }

    /// Send `payload` to the remote peer.
    ///
    /// Blocks while the pool is empty; returns `Cancelled` if `ctx` is
    /// cancelled during the wait and `ConnClosed` if the connection shuts
    /// down mid-call. Returns once the post is accepted, not once it
    /// completes. A buffer acquired here is either handed to the fabric or
    /// released back on the error path; it is never leaked.
    pub fn transmit(&self, ctx: &Context, payload: &[u8]) -> Result<()> {
        match self.core.state() {
            State::Active => {}
            State::Closed => return Err(TransportError::ConnClosed),
            other => return Err(TransportError::wrong_state("transmit", other)),
        }
        let transfer_size = self
            .rdma
            .transfer_size()
            .ok_or(TransportError::ConnClosed)?;
        if payload.len() > transfer_size {
            return Err(TransportError::bad_argument(format!(
                "payload of {} bytes exceeds transfer_size {}",
                payload.len(),
                transfer_size
            )));
        }
        let (endpoint, pool) = match (self.rdma.endpoint(), self.rdma.pool()) {
            (Some(endpoint), Some(pool)) => (endpoint, pool),
            _ => return Err(TransportError::ConnClosed),
        };

        let mut buf = pool.acquire(ctx)?;
        buf.fill(payload);
        let (addr, mr, len) = (buf.addr(), buf.mr(), buf.len() as u32);
        match endpoint.post_send(buf.index() as u64, addr, len, mr) {
            Ok(()) => {
                // Owned by the fabric now; the reaper releases it on
                // completion.
                buf.detach();
                self.metrics.record_transmit(payload.len());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pool occupancy, while the connection is established.
    pub fn pool_stats(&self) -> Option<BufferPoolStats> {
        self.rdma.pool().map(|p| p.stats())
    }
}

impl Connection for RdmaTx {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn on_establish(&self, ctx: &Context) -> Result<()> {
        let (endpoint, pool) = self.rdma.bring_up(EndpointRole::Transmit)?;
        let (wctx, cancel) = self.rdma.start_work_context(ctx);
        let paused = self.rdma.paused_flag();
        let metrics = Arc::clone(&self.metrics);
        if let Err(e) = self.rdma.spawn_worker("rdma-tx-cq", move || {
            reaper_worker(wctx, endpoint, pool, cancel, paused, metrics)
        }) {
            self.rdma.tear_down();
            return Err(e);
        }
        Ok(())
    }

    fn on_suspend(&self, _ctx: &Context) -> Result<()> {
        self.rdma.set_paused(true);
        Ok(())
    }

    fn on_resume(&self, _ctx: &Context) -> Result<()> {
        self.rdma.set_paused(false);
        Ok(())
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        self.rdma.tear_down();
        Ok(())
    }
}

fn reaper_worker(
    ctx: Context,
    endpoint: Arc<dyn FabricEndpoint>,
    pool: Arc<BufferPool>,
    cancel: CancelHandle,
    paused: Arc<AtomicBool>,
    metrics: Arc<TransportMetrics>,
) {
    let mut events = [CqEvent::default(); CQ_BATCH_SIZE];
    loop {
        if ctx.cancelled() {
            return;
        }
        if paused.load(Ordering::SeqCst) {
            ctx.sleep(DEFAULT_POLL_TIMEOUT);
            continue;
        }
        match endpoint.cq_read(&mut events, DEFAULT_POLL_TIMEOUT) {
            Ok(0) => {}
            Ok(n) => {
                for event in &events[..n] {
                    pool.release_index(event.wr_id as usize);
                }
            }
            Err(e) => {
                if !ctx.cancelled() {
                    error!(error = %e, "tx completion read failed; cancelling connection pipeline");
                    metrics.record_fabric_error();
                    cancel.cancel();
                }
                return;
            }
        }
    }
}

impl std::fmt::Debug for RdmaTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaTx")
            .field("state", &self.core.state())
            .finish()
    }
}
