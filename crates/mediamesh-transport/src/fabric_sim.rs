//! In-process loopback fabric.
//!
//! A software implementation of the fabric façade for running the transport
//! without RDMA hardware. Endpoints register themselves under their local
//! address; a send is matched against the receive buffers posted by the
//! endpoint registered under the sender's remote address, so a Tx/Rx pair
//! configured with mirrored addresses forms a loopback wire inside one
//! process.
//!
//! The fabric doubles as the test mock: it can fail endpoint creation,
//! fail memory registration from the N-th call on, delay or hold send
//! completions, and it counts bring-up/teardown so tests can assert on
//! resource lifecycles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::fabric::{
    CqEvent, EndpointConfig, FabricDevice, FabricEndpoint, FabricProvider, MrHandle,
};

/// Static configuration of a [`SimFabric`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// Delay between a send post and its completion becoming readable.
    pub completion_delay: Duration,
    /// Fail every `endpoint_init` call.
    pub fail_endpoint_init: bool,
    /// Fail `register_memory` calls whose zero-based global index is at or
    /// past this value.
    pub fail_register_at: Option<u32>,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            completion_delay: Duration::ZERO,
            fail_endpoint_init: false,
            fail_register_at: None,
        }
    }
}

/// Counters exposed by the simulated fabric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimFabricStats {
    /// Endpoints created.
    pub endpoints_created: u64,
    /// Endpoints destroyed.
    pub endpoints_destroyed: u64,
    /// Successful memory registrations.
    pub registrations: u64,
    /// Send work requests accepted.
    pub sends_posted: u64,
    /// Receive work requests accepted.
    pub recvs_posted: u64,
    /// Payload bytes carried by accepted sends.
    pub bytes_sent: u64,
    /// Payload bytes copied into receive buffers.
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatsInner {
    endpoints_created: AtomicU64,
    endpoints_destroyed: AtomicU64,
    registrations: AtomicU64,
    sends_posted: AtomicU64,
    recvs_posted: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_events_read: AtomicU64,
}

struct Knobs {
    completion_delay: Mutex<Duration>,
    hold_completions: AtomicBool,
    fail_endpoint_init: AtomicBool,
    fail_register_at: Mutex<Option<u32>>,
    register_calls: AtomicU32,
}

struct SimShared {
    knobs: Knobs,
    devices: Mutex<HashMap<String, Weak<SimDevice>>>,
    endpoints: Mutex<HashMap<String, Weak<SimEndpoint>>>,
    stats: StatsInner,
}

/// Software fabric provider.
pub struct SimFabric {
    shared: Arc<SimShared>,
}

impl SimFabric {
    /// Create a fabric with the given configuration.
    pub fn new(config: SimFabricConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(SimShared {
                knobs: Knobs {
                    completion_delay: Mutex::new(config.completion_delay),
                    hold_completions: AtomicBool::new(false),
                    fail_endpoint_init: AtomicBool::new(config.fail_endpoint_init),
                    fail_register_at: Mutex::new(config.fail_register_at),
                    register_calls: AtomicU32::new(0),
                },
                devices: Mutex::new(HashMap::new()),
                endpoints: Mutex::new(HashMap::new()),
                stats: StatsInner::default(),
            }),
        })
    }

    /// Fabric with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(SimFabricConfig::default())
    }

    /// Change the send-completion delay.
    pub fn set_completion_delay(&self, delay: Duration) {
        *self.shared.knobs.completion_delay.lock().unwrap() = delay;
    }

    /// Hold send completions until released with [`release_completions`].
    ///
    /// [`release_completions`]: SimFabric::release_completions
    pub fn set_hold_completions(&self, hold: bool) {
        self.shared
            .knobs
            .hold_completions
            .store(hold, Ordering::SeqCst);
    }

    /// Release up to `n` held send completions, returning how many were
    /// released.
    pub fn release_completions(&self, n: usize) -> usize {
        let endpoints: Vec<Arc<SimEndpoint>> = {
            let map = self.shared.endpoints.lock().unwrap();
            map.values().filter_map(Weak::upgrade).collect()
        };
        let mut remaining = n;
        for ep in endpoints {
            if remaining == 0 {
                break;
            }
            let mut state = ep.state.lock().unwrap();
            while remaining > 0 {
                match state.held.pop_front() {
                    Some(comp) => {
                        state.ready.push_back(comp);
                        remaining -= 1;
                    }
                    None => break,
                }
            }
            ep.cv.notify_all();
        }
        n - remaining
    }

    /// Toggle endpoint-creation failure.
    pub fn set_fail_endpoint_init(&self, fail: bool) {
        self.shared
            .knobs
            .fail_endpoint_init
            .store(fail, Ordering::SeqCst);
    }

    /// Fail registration calls from the given zero-based global index on;
    /// `None` disables failure injection.
    pub fn set_fail_register_at(&self, at: Option<u32>) {
        *self.shared.knobs.fail_register_at.lock().unwrap() = at;
    }

    /// Sends whose completion has not been read from a CQ yet.
    pub fn outstanding_sends(&self) -> u64 {
        let posted = self.shared.stats.sends_posted.load(Ordering::SeqCst);
        let read = self.shared.stats.send_events_read.load(Ordering::SeqCst);
        posted.saturating_sub(read)
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> SimFabricStats {
        let s = &self.shared.stats;
        SimFabricStats {
            endpoints_created: s.endpoints_created.load(Ordering::SeqCst),
            endpoints_destroyed: s.endpoints_destroyed.load(Ordering::SeqCst),
            registrations: s.registrations.load(Ordering::SeqCst),
            sends_posted: s.sends_posted.load(Ordering::SeqCst),
            recvs_posted: s.recvs_posted.load(Ordering::SeqCst),
            bytes_sent: s.bytes_sent.load(Ordering::SeqCst),
            bytes_received: s.bytes_received.load(Ordering::SeqCst),
        }
    }
}

impl FabricProvider for SimFabric {
    fn device_init(&self, dev_port: &str) -> Result<Arc<dyn FabricDevice>> {
        let mut devices = self.shared.devices.lock().unwrap();
        if let Some(existing) = devices.get(dev_port).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let device = Arc::new(SimDevice {
            dev_port: dev_port.to_string(),
            shared: Arc::clone(&self.shared),
        });
        devices.insert(dev_port.to_string(), Arc::downgrade(&device));
        debug!(dev_port, "sim fabric device opened");
        Ok(device)
    }
}

struct SimDevice {
    dev_port: String,
    shared: Arc<SimShared>,
}

impl FabricDevice for SimDevice {
    fn endpoint_init(&self, cfg: &EndpointConfig) -> Result<Arc<dyn FabricEndpoint>> {
        if self.shared.knobs.fail_endpoint_init.load(Ordering::SeqCst) {
            return Err(TransportError::InitializationFailed {
                reason: "simulated endpoint failure".to_string(),
            });
        }
        let endpoint = Arc::new(SimEndpoint {
            cfg: cfg.clone(),
            shared: Arc::clone(&self.shared),
            state: Mutex::new(EpState::default()),
            cv: Condvar::new(),
        });
        self.shared
            .endpoints
            .lock()
            .unwrap()
            .insert(cfg.local.clone(), Arc::downgrade(&endpoint));
        self.shared
            .stats
            .endpoints_created
            .fetch_add(1, Ordering::SeqCst);
        debug!(dev_port = %self.dev_port, local = %cfg.local, remote = %cfg.remote, "sim endpoint created");
        Ok(endpoint)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CompletionKind {
    Send,
    Recv,
}

#[derive(Clone, Copy)]
struct SimCompletion {
    event: CqEvent,
    kind: CompletionKind,
}

struct PostedRecv {
    wr_id: u64,
    addr: u64,
    len: u32,
}

#[derive(Default)]
struct EpState {
    destroyed: bool,
    next_mr: u64,
    regions: HashMap<u64, (u64, usize)>,
    posted_recvs: VecDeque<PostedRecv>,
    pending: VecDeque<Vec<u8>>,
    ready: VecDeque<SimCompletion>,
    delayed: Vec<(Instant, SimCompletion)>,
    held: VecDeque<SimCompletion>,
}

impl EpState {
    fn check_region(&self, mr: MrHandle, addr: u64, len: u32) -> Result<()> {
        match self.regions.get(&mr.0) {
            Some(&(base, size)) => {
                let end = addr.saturating_add(u64::from(len));
                if addr < base || end > base + size as u64 {
                    Err(TransportError::fabric("post outside registered region"))
                } else {
                    Ok(())
                }
            }
            None => Err(TransportError::fabric("unknown memory region")),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, comp) = self.delayed.remove(i);
                self.ready.push_back(comp);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

struct SimEndpoint {
    cfg: EndpointConfig,
    shared: Arc<SimShared>,
    state: Mutex<EpState>,
    cv: Condvar,
}

impl SimEndpoint {
    fn deliver_to_remote(&self, payload: Vec<u8>) {
        let remote = {
            let map = self.shared.endpoints.lock().unwrap();
            map.get(&self.cfg.remote).and_then(Weak::upgrade)
        };
        let Some(remote) = remote else {
            debug!(remote = %self.cfg.remote, "no remote endpoint; payload dropped on the wire");
            return;
        };
        let mut state = remote.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        match state.posted_recvs.pop_front() {
            Some(recv) => {
                let copied = payload.len().min(recv.len as usize);
                // Safety: the target range was validated against a live
                // registration when the recv was posted.
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), recv.addr as *mut u8, copied);
                }
                state.ready.push_back(SimCompletion {
                    event: CqEvent {
                        wr_id: recv.wr_id,
                        len: copied as u32,
                    },
                    kind: CompletionKind::Recv,
                });
                self.shared
                    .stats
                    .bytes_received
                    .fetch_add(copied as u64, Ordering::SeqCst);
                remote.cv.notify_all();
            }
            None => {
                state.pending.push_back(payload);
            }
        }
    }

    fn queue_send_completion(&self, comp: SimCompletion) {
        let delay = *self.shared.knobs.completion_delay.lock().unwrap();
        let hold = self.shared.knobs.hold_completions.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        if hold {
            state.held.push_back(comp);
        } else if delay > Duration::ZERO {
            state.delayed.push((Instant::now() + delay, comp));
        } else {
            state.ready.push_back(comp);
            self.cv.notify_all();
        }
    }
}

impl FabricEndpoint for SimEndpoint {
    fn register_memory(&self, addr: u64, len: usize) -> Result<MrHandle> {
        let call = self
            .shared
            .knobs
            .register_calls
            .fetch_add(1, Ordering::SeqCst);
        if let Some(at) = *self.shared.knobs.fail_register_at.lock().unwrap() {
            if call >= at {
                return Err(TransportError::MemoryRegistrationFailed {
                    reason: format!("simulated registration failure at call {call}"),
                });
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(TransportError::ConnClosed);
        }
        let id = state.next_mr;
        state.next_mr += 1;
        state.regions.insert(id, (addr, len));
        self.shared
            .stats
            .registrations
            .fetch_add(1, Ordering::SeqCst);
        Ok(MrHandle(id))
    }

    fn unregister_memory(&self, mr: MrHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.regions.remove(&mr.0);
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, addr: u64, len: u32, mr: MrHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(TransportError::ConnClosed);
        }
        state.check_region(mr, addr, len)?;
        self.shared
            .stats
            .recvs_posted
            .fetch_add(1, Ordering::SeqCst);
        if let Some(payload) = state.pending.pop_front() {
            let copied = payload.len().min(len as usize);
            // Safety: range validated against a live registration above.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), addr as *mut u8, copied);
            }
            state.ready.push_back(SimCompletion {
                event: CqEvent {
                    wr_id,
                    len: copied as u32,
                },
                kind: CompletionKind::Recv,
            });
            self.shared
                .stats
                .bytes_received
                .fetch_add(copied as u64, Ordering::SeqCst);
            self.cv.notify_all();
        } else {
            state.posted_recvs.push_back(PostedRecv { wr_id, addr, len });
        }
        Ok(())
    }

    fn post_send(&self, wr_id: u64, addr: u64, len: u32, mr: MrHandle) -> Result<()> {
        let payload = {
            let state = self.state.lock().unwrap();
            if state.destroyed {
                return Err(TransportError::ConnClosed);
            }
            state.check_region(mr, addr, len)?;
            // Safety: source range validated against a live registration.
            unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize).to_vec() }
        };
        self.shared
            .stats
            .sends_posted
            .fetch_add(1, Ordering::SeqCst);
        self.shared
            .stats
            .bytes_sent
            .fetch_add(u64::from(len), Ordering::SeqCst);
        self.deliver_to_remote(payload);
        self.queue_send_completion(SimCompletion {
            event: CqEvent { wr_id, len },
            kind: CompletionKind::Send,
        });
        Ok(())
    }

    fn cq_read(&self, events: &mut [CqEvent], timeout: Duration) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.destroyed {
                return Err(TransportError::ConnClosed);
            }
            let now = Instant::now();
            state.promote_due(now);
            if !state.ready.is_empty() {
                let n = events.len().min(state.ready.len());
                for slot in events.iter_mut().take(n) {
                    let comp = state.ready.pop_front().unwrap();
                    *slot = comp.event;
                    if comp.kind == CompletionKind::Send {
                        self.shared
                            .stats
                            .send_events_read
                            .fetch_add(1, Ordering::SeqCst);
                    }
                }
                return Ok(n);
            }
            if now >= deadline {
                return Ok(0);
            }
            let mut wake = deadline;
            if let Some(due) = state.next_due() {
                wake = wake.min(due);
            }
            let (g, _) = self.cv.wait_timeout(state, wake - now).unwrap();
            state = g;
        }
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.posted_recvs.clear();
        state.pending.clear();
        state.ready.clear();
        state.delayed.clear();
        state.held.clear();
        self.shared
            .stats
            .endpoints_destroyed
            .fetch_add(1, Ordering::SeqCst);
        self.cv.notify_all();
        debug!(local = %self.cfg.local, "sim endpoint destroyed");
    }
}

impl Drop for SimEndpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}
