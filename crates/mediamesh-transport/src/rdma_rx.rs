//! RDMA receive connection.
//!
//! On establishment every pool buffer is posted to the fabric as a receive.
//! A CQ worker drains completions in batches and forwards them, in
//! completion-queue order, over a bounded channel to the processing worker,
//! which hands each payload to the linked consumer as a [`FrameLease`] and
//! re-posts buffers as the consumer releases them. If the consumer is slow
//! the pool drains, nothing is re-posted, and the fabric's own flow control
//! throttles the remote sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, warn};

use crate::buffer::{BufferPool, BufferPoolStats, FrameLease};
use crate::config::RdmaConnectionConfig;
use crate::connection::{Connection, ConnectionCore, Kind, State};
use crate::context::{CancelHandle, Context};
use crate::error::{Result, TransportError};
use crate::fabric::{
    CqEvent, EndpointRole, FabricEndpoint, FabricProvider, CQ_BATCH_SIZE, DEFAULT_POLL_TIMEOUT,
};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::rdma::{RdmaCore, RdmaSetup};

/// Receiver half of an RDMA connection pair.
pub struct RdmaRx {
    core: ConnectionCore,
    rdma: RdmaCore,
    metrics: Arc<TransportMetrics>,
}

impl RdmaRx {
    /// Create an unconfigured receive connection.
    pub fn new() -> Arc<Self> {
        Arc::new(RdmaRx {
            core: ConnectionCore::new(Kind::Receiver),
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

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pool occupancy, while the connection is established.
    pub fn pool_stats(&self) -> Option<BufferPoolStats> {
        self.rdma.pool().map(|p| p.stats())
    }
}

impl Connection for RdmaRx {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn on_establish(&self, ctx: &Context) -> Result<()> {
        let (endpoint, pool) = self.rdma.bring_up(EndpointRole::Receive)?;

        // Post every buffer as a receive before the workers start.
        while let Some(index) = pool.try_pop() {
            if let Err(e) = endpoint.post_recv(
                index as u64,
                pool.addr_of(index),
                pool.buffer_size() as u32,
                pool.mr_of(index),
            ) {
                self.rdma.tear_down();
                return Err(e);
            }
        }

        let (wctx, cancel) = self.rdma.start_work_context(ctx);
        let (ready_tx, ready_rx) =
            std::sync::mpsc::sync_channel::<CqEvent>(pool.capacity().max(1));

        let paused = self.rdma.paused_flag();
        let spawned = {
            let wctx = wctx.clone();
            let endpoint = Arc::clone(&endpoint);
            let cancel = cancel.clone();
            let paused = Arc::clone(&paused);
            let metrics = Arc::clone(&self.metrics);
            self.rdma.spawn_worker("rdma-rx-cq", move || {
                cq_worker(wctx, endpoint, ready_tx, cancel, paused, metrics)
            })
        }
        .and_then(|()| {
            let link = self.core.sink_slot();
            let metrics = Arc::clone(&self.metrics);
            self.rdma.spawn_worker("rdma-rx-process", move || {
                process_worker(wctx, endpoint, pool, ready_rx, link, cancel, paused, metrics)
            })
        });
        if let Err(e) = spawned {
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

fn cq_worker(
    ctx: Context,
    endpoint: Arc<dyn FabricEndpoint>,
    ready: SyncSender<CqEvent>,
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
                    if ready.send(*event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                if !ctx.cancelled() {
                    error!(error = %e, "rx completion read failed; cancelling connection pipeline");
                    metrics.record_fabric_error();
                    cancel.cancel();
                }
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn process_worker(
    ctx: Context,
    endpoint: Arc<dyn FabricEndpoint>,
    pool: Arc<BufferPool>,
    ready: Receiver<CqEvent>,
    link: Arc<Mutex<Weak<dyn Connection>>>,
    cancel: CancelHandle,
    paused: Arc<AtomicBool>,
    metrics: Arc<TransportMetrics>,
) {
    loop {
        if ctx.cancelled() {
            return;
        }
        if paused.load(Ordering::SeqCst) {
            ctx.sleep(DEFAULT_POLL_TIMEOUT);
            continue;
        }
        match ready.recv_timeout(DEFAULT_POLL_TIMEOUT) {
            Ok(event) => {
                let lease = pool.lease(event.wr_id as usize, event.len as usize);
                deliver(&ctx, lease, &link, &metrics);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        // Buffers released by the consumer go straight back to the fabric.
        while let Some(index) = pool.try_pop() {
            if let Err(e) = endpoint.post_recv(
                index as u64,
                pool.addr_of(index),
                pool.buffer_size() as u32,
                pool.mr_of(index),
            ) {
                if !ctx.cancelled() {
                    error!(error = %e, "rx re-post failed; cancelling connection pipeline");
                    metrics.record_fabric_error();
                    cancel.cancel();
                }
                return;
            }
        }
    }
}

fn deliver(
    ctx: &Context,
    lease: FrameLease,
    link: &Arc<Mutex<Weak<dyn Connection>>>,
    metrics: &TransportMetrics,
) {
    let sink = link.lock().unwrap().upgrade();
    match sink {
        Some(sink) => {
            let len = lease.len();
            // Sink return values are advisory and never stop the pipeline.
            if let Err(e) = sink.on_receive(ctx, lease) {
                warn!(error = %e, "linked consumer rejected payload");
                metrics.record_delivery_error();
            } else {
                metrics.record_delivery(len);
            }
        }
        None => {
            warn!(len = lease.len(), "no linked consumer; payload dropped");
            metrics.record_drop();
        }
    }
}

impl std::fmt::Debug for RdmaRx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaRx")
            .field("state", &self.core.state())
            .finish()
    }
}
