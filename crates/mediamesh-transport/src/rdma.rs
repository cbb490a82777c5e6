//! Plumbing shared by the RDMA Tx and Rx connections: configuration
//! storage, endpoint and pool bring-up with rollback, worker lifecycle and
//! teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::buffer::BufferPool;
use crate::config::RdmaConnectionConfig;
use crate::context::{CancelHandle, Context};
use crate::error::{Result, TransportError};
use crate::fabric::{
    EndpointConfig, EndpointRole, FabricDevice, FabricEndpoint, FabricProvider,
};

/// Configure-time inputs kept until establishment.
#[derive(Clone)]
pub(crate) struct RdmaSetup {
    pub cfg: RdmaConnectionConfig,
    pub dev_port: String,
    pub provider: Arc<dyn FabricProvider>,
}

/// Resources and workers of one established RDMA connection.
pub(crate) struct RdmaCore {
    setup: Mutex<Option<RdmaSetup>>,
    device: Mutex<Option<Arc<dyn FabricDevice>>>,
    endpoint: Mutex<Option<Arc<dyn FabricEndpoint>>>,
    pool: Mutex<Option<Arc<BufferPool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    work_cancel: Mutex<Option<CancelHandle>>,
    paused: Arc<AtomicBool>,
}

impl RdmaCore {
    pub fn new() -> Self {
        RdmaCore {
            setup: Mutex::new(None),
            device: Mutex::new(None),
            endpoint: Mutex::new(None),
            pool: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            work_cancel: Mutex::new(None),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store_setup(&self, setup: RdmaSetup) {
        *self.setup.lock().unwrap() = Some(setup);
    }

    pub fn setup(&self) -> Result<RdmaSetup> {
        self.setup
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::wrong_state("establish", "not_configured"))
    }

    pub fn endpoint(&self) -> Option<Arc<dyn FabricEndpoint>> {
        self.endpoint.lock().unwrap().clone()
    }

    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.pool.lock().unwrap().clone()
    }

    pub fn transfer_size(&self) -> Option<usize> {
        self.setup
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.cfg.transfer_size as usize)
    }

    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Bring up device, endpoint and pool. If pool creation (allocation or
    /// memory registration) fails after the endpoint exists, the endpoint
    /// is destroyed before the error is returned.
    pub fn bring_up(
        &self,
        role: EndpointRole,
    ) -> Result<(Arc<dyn FabricEndpoint>, Arc<BufferPool>)> {
        let setup = self.setup()?;
        let device = setup.provider.device_init(&setup.dev_port)?;
        let ep_cfg = EndpointConfig {
            role,
            local: setup.cfg.local_addr(),
            remote: setup.cfg.remote_addr(),
            buffer_size: setup.cfg.transfer_size as usize,
            queue_depth: setup.cfg.queue_depth as usize,
        };
        let endpoint = device.endpoint_init(&ep_cfg)?;
        let pool = match BufferPool::init(
            Arc::clone(&endpoint),
            setup.cfg.queue_depth as usize,
            setup.cfg.transfer_size as usize,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                endpoint.destroy();
                return Err(e);
            }
        };
        *self.device.lock().unwrap() = Some(device);
        *self.endpoint.lock().unwrap() = Some(Arc::clone(&endpoint));
        *self.pool.lock().unwrap() = Some(Arc::clone(&pool));
        Ok((endpoint, pool))
    }

    /// Create the connection-internal context, a child of `parent`.
    /// Cancelling it stops every worker at its next loop boundary.
    pub fn start_work_context(&self, parent: &Context) -> (Context, CancelHandle) {
        let (ctx, handle) = Context::with_cancel(parent);
        *self.work_cancel.lock().unwrap() = Some(handle.clone());
        (ctx, handle)
    }

    /// Spawn a named worker thread and track its handle for joining.
    pub fn spawn_worker<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| TransportError::InitializationFailed {
                reason: format!("failed to spawn {name}: {e}"),
            })?;
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    /// Cancel the internal context, join workers, close the pool and
    /// destroy the endpoint. Safe to call on a partially built or already
    /// torn down core.
    pub fn tear_down(&self) {
        if let Some(cancel) = self.work_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        let current = std::thread::current().id();
        for worker in workers {
            // A worker observing cancellation may drive the shutdown itself;
            // it cannot join its own handle.
            if worker.thread().id() == current {
                continue;
            }
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!(worker = %name, "worker panicked before join");
            }
        }
        if let Some(pool) = self.pool.lock().unwrap().take() {
            pool.close();
        }
        if let Some(endpoint) = self.endpoint.lock().unwrap().take() {
            endpoint.destroy();
        }
        self.device.lock().unwrap().take();
        self.set_paused(false);
    }
}
