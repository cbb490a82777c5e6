//! Test doubles and builders for connection-core scenarios.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mediamesh_transport::{
    link, Connection, ConnectionCore, Context, FrameLease, Kind, RdmaConnectionConfig, RdmaRx,
    RdmaTx, Result, SimFabric, SimFabricConfig, State, TransportError,
};

/// Device port used by every test scenario, mirroring a PCI address.
pub const TEST_DEV_PORT: &str = "0000:31:00.0";

/// A consuming connection that records every delivered payload.
///
/// Stand-in for the downstream half of the proxy (e.g. a shared-memory or
/// ST 2110 session driver) in loopback tests.
pub struct CollectingSink {
    core: ConnectionCore,
    received: Mutex<Vec<Vec<u8>>>,
    reject_next: AtomicBool,
}

impl CollectingSink {
    /// A sink in `configured` state, ready to establish.
    pub fn new() -> Arc<Self> {
        let sink = Arc::new(CollectingSink {
            core: ConnectionCore::new(Kind::Receiver),
            received: Mutex::new(Vec::new()),
            reject_next: AtomicBool::new(false),
        });
        sink.core.set_state(State::Configured);
        sink
    }

    /// Payloads delivered so far, in delivery order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Number of payloads delivered so far.
    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Make the next delivery return an error (advisory to the pipeline).
    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Poll until `n` payloads arrived or `timeout` elapses.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.count() >= n
    }
}

impl Connection for CollectingSink {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn on_establish(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn on_receive(&self, _ctx: &Context, frame: FrameLease) -> Result<()> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::BadArgument {
                reason: "sink rejected payload".to_string(),
            });
        }
        self.received.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// An established Tx→Rx loopback pair with a collecting sink linked to the
/// receiver.
pub struct LoopbackPair {
    /// The shared software fabric.
    pub fabric: Arc<SimFabric>,
    /// Transmit connection, established.
    pub tx: Arc<RdmaTx>,
    /// Receive connection, established and linked to `sink`.
    pub rx: Arc<RdmaRx>,
    /// Consumer of everything the receiver delivers.
    pub sink: Arc<CollectingSink>,
    /// Root context of the pair.
    pub ctx: Context,
}

/// Configuration for the receive side of a loopback pair.
pub fn rx_config(transfer_size: u32, queue_depth: u32) -> RdmaConnectionConfig {
    RdmaConnectionConfig {
        local_ip: "192.168.1.20".to_string(),
        local_port: 8002,
        remote_ip: "192.168.1.10".to_string(),
        remote_port: 8001,
        transfer_size,
        queue_depth,
    }
}

/// Configuration for the transmit side of a loopback pair.
pub fn tx_config(transfer_size: u32, queue_depth: u32) -> RdmaConnectionConfig {
    RdmaConnectionConfig {
        local_ip: "192.168.1.10".to_string(),
        local_port: 8001,
        remote_ip: "192.168.1.20".to_string(),
        remote_port: 8002,
        transfer_size,
        queue_depth,
    }
}

/// Build a fully established pair on a fresh default fabric.
pub fn loopback_pair(transfer_size: u32, queue_depth: u32) -> LoopbackPair {
    loopback_pair_on(SimFabric::new(SimFabricConfig::default()), transfer_size, queue_depth)
}

/// Build a fully established pair on the given fabric.
pub fn loopback_pair_on(
    fabric: Arc<SimFabric>,
    transfer_size: u32,
    queue_depth: u32,
) -> LoopbackPair {
    let ctx = Context::background();

    let rx = RdmaRx::new();
    rx.configure(
        &ctx,
        rx_config(transfer_size, queue_depth),
        TEST_DEV_PORT,
        fabric.clone(),
    )
    .expect("rx configure");
    rx.establish(&ctx).expect("rx establish");

    let sink = CollectingSink::new();
    sink.establish(&ctx).expect("sink establish");
    let rx_conn: Arc<dyn Connection> = rx.clone();
    let sink_conn: Arc<dyn Connection> = sink.clone();
    link(&ctx, &rx_conn, &sink_conn).expect("link rx to sink");

    let tx = RdmaTx::new();
    tx.configure(
        &ctx,
        tx_config(transfer_size, queue_depth),
        TEST_DEV_PORT,
        fabric.clone(),
    )
    .expect("tx configure");
    tx.establish(&ctx).expect("tx establish");

    LoopbackPair {
        fabric,
        tx,
        rx,
        sink,
        ctx,
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
