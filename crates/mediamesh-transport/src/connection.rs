//! Connection lifecycle.
//!
//! A connection is created `not_configured`, becomes `configured` once its
//! parameters validate, `active` after establishment, and ends `closed`.
//! The state is the only source of truth for which operations are legal;
//! the provided trait methods enforce the transition guards and delegate
//! the transport-specific work to the `on_*` hooks.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, warn};

use crate::buffer::FrameLease;
use crate::context::Context;
use crate::error::{Result, TransportError};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly created; no parameters accepted yet.
    NotConfigured,
    /// Parameters validated and stored.
    Configured,
    /// Established: resources allocated, workers running.
    Active,
    /// Workers paused; resources retained.
    Suspended,
    /// Terminal. Resources released.
    Closed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::NotConfigured => "not_configured",
            State::Configured => "configured",
            State::Active => "active",
            State::Suspended => "suspended",
            State::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Role of a connection. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Produces data toward the fabric.
    Transmitter,
    /// Consumes data from the fabric.
    Receiver,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Transmitter => "transmitter",
            Kind::Receiver => "receiver",
        })
    }
}

type LinkSlot = Arc<Mutex<Weak<dyn Connection>>>;

/// Shared lifecycle bookkeeping embedded in every connection.
pub struct ConnectionCore {
    kind: Kind,
    state: Mutex<State>,
    // Serializes establish/suspend/resume/shutdown so a shutdown issued
    // concurrently with establish blocks until establish returns.
    lifecycle: Mutex<()>,
    link: LinkSlot,
    linked_by: Mutex<Weak<dyn Connection>>,
}

impl ConnectionCore {
    /// Create a core in `not_configured`.
    pub fn new(kind: Kind) -> Self {
        let empty: Weak<dyn Connection> = Weak::<NullConnection>::new();
        ConnectionCore {
            kind,
            state: Mutex::new(State::NotConfigured),
            lifecycle: Mutex::new(()),
            link: Arc::new(Mutex::new(empty.clone())),
            linked_by: Mutex::new(empty),
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Role of the owning connection.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Record a state transition. Connection implementations call this from
    /// their `configure` step; the lifecycle transitions themselves are
    /// driven by the provided trait methods.
    pub fn set_state(&self, next: State) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            debug!(kind = %self.kind, from = %*state, to = %next, "connection state transition");
            *state = next;
        }
    }

    /// The linked consumer, if one is set and still alive.
    pub fn sink(&self) -> Option<Arc<dyn Connection>> {
        self.link.lock().unwrap().upgrade()
    }

    pub(crate) fn sink_slot(&self) -> LinkSlot {
        Arc::clone(&self.link)
    }

    pub(crate) fn set_sink(&self, sink: Weak<dyn Connection>) {
        *self.link.lock().unwrap() = sink;
    }

    pub(crate) fn set_source(&self, source: Weak<dyn Connection>) {
        *self.linked_by.lock().unwrap() = source;
    }

    /// The producer that linked itself to this connection, for bookkeeping.
    pub fn source(&self) -> Option<Arc<dyn Connection>> {
        self.linked_by.lock().unwrap().upgrade()
    }
}

// Placeholder target for empty Weak slots.
struct NullConnection;

impl Connection for NullConnection {
    fn core(&self) -> &ConnectionCore {
        unreachable!("null connection is never instantiated")
    }

    fn on_establish(&self, _ctx: &Context) -> Result<()> {
        unreachable!("null connection is never instantiated")
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        unreachable!("null connection is never instantiated")
    }
}

/// A media-plane connection endpoint.
///
/// Implementors provide the `on_*` hooks; the provided methods implement
/// the state machine. All methods take `&self`: connections are shared
/// across threads and use interior mutability.
pub trait Connection: Send + Sync {
    /// The embedded lifecycle core.
    fn core(&self) -> &ConnectionCore;

    /// Allocate resources and start workers. Runs with the lifecycle lock
    /// held; on error the implementation has already rolled back whatever
    /// it allocated.
    fn on_establish(&self, ctx: &Context) -> Result<()>;

    /// Pause the connection's workers.
    fn on_suspend(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Resume the connection's workers.
    fn on_resume(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Stop workers and release resources.
    fn on_shutdown(&self, ctx: &Context) -> Result<()>;

    /// Deliver a received payload to this connection (receivers and
    /// transport sinks). The default drops the payload with a warning.
    fn on_receive(&self, _ctx: &Context, frame: FrameLease) -> Result<()> {
        warn!(kind = %self.core().kind(), len = frame.len(), "payload dropped: connection does not consume frames");
        Ok(())
    }

    /// Transition `configured` -> `active`, running [`on_establish`].
    ///
    /// A second establish on an active connection returns
    /// `AlreadyInitialized` and leaves the state untouched. On hook failure
    /// the state becomes `closed`.
    ///
    /// [`on_establish`]: Connection::on_establish
    fn establish(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.core().lifecycle.lock().unwrap();
        match self.core().state() {
            State::Configured => {}
            State::Active => return Err(TransportError::AlreadyInitialized),
            other => return Err(TransportError::wrong_state("establish", other)),
        }
        match self.on_establish(ctx) {
            Ok(()) => {
                self.core().set_state(State::Active);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "establish failed; closing connection");
                self.core().set_state(State::Closed);
                Err(e)
            }
        }
    }

    /// Transition `active` -> `suspended`, running [`on_suspend`].
    ///
    /// [`on_suspend`]: Connection::on_suspend
    fn suspend(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.core().lifecycle.lock().unwrap();
        match self.core().state() {
            State::Active => {}
            other => return Err(TransportError::wrong_state("suspend", other)),
        }
        self.on_suspend(ctx)?;
        self.core().set_state(State::Suspended);
        Ok(())
    }

    /// Transition `suspended` -> `active`, running [`on_resume`].
    ///
    /// [`on_resume`]: Connection::on_resume
    fn resume(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.core().lifecycle.lock().unwrap();
        match self.core().state() {
            State::Suspended => {}
            other => return Err(TransportError::wrong_state("resume", other)),
        }
        self.on_resume(ctx)?;
        self.core().set_state(State::Active);
        Ok(())
    }

    /// Transition any non-terminal state -> `closed`, running
    /// [`on_shutdown`]. Idempotent; hook errors are logged, not propagated.
    /// Callable from any thread, including a worker observing cancellation.
    ///
    /// [`on_shutdown`]: Connection::on_shutdown
    fn shutdown(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.core().lifecycle.lock().unwrap();
        if self.core().state() == State::Closed {
            return Ok(());
        }
        if let Err(e) = self.on_shutdown(ctx) {
            error!(error = %e, "shutdown hook failed; closing anyway");
        }
        self.core().set_state(State::Closed);
        Ok(())
    }

    /// Current state.
    fn state(&self) -> State {
        self.core().state()
    }

    /// Role of this connection.
    fn kind(&self) -> Kind {
        self.core().kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ScriptedConnection {
        core: ConnectionCore,
        fail_establish: AtomicBool,
        establish_calls: AtomicU32,
        shutdown_calls: AtomicU32,
    }

    impl ScriptedConnection {
        fn new(kind: Kind) -> Arc<Self> {
            Arc::new(Self {
                core: ConnectionCore::new(kind),
                fail_establish: AtomicBool::new(false),
                establish_calls: AtomicU32::new(0),
                shutdown_calls: AtomicU32::new(0),
            })
        }

        fn configure(&self) {
            self.core.set_state(State::Configured);
        }
    }

    impl Connection for ScriptedConnection {
        fn core(&self) -> &ConnectionCore {
            &self.core
        }

        fn on_establish(&self, _ctx: &Context) -> Result<()> {
            self.establish_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_establish.load(Ordering::SeqCst) {
                Err(TransportError::InitializationFailed {
                    reason: "scripted".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_initial_state() {
        let conn = ScriptedConnection::new(Kind::Receiver);
        assert_eq!(conn.state(), State::NotConfigured);
        assert_eq!(conn.kind(), Kind::Receiver);
    }

    #[test]
    fn test_establish_requires_configured() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        let err = conn.establish(&ctx).err().unwrap();
        assert!(matches!(err, TransportError::WrongState { .. }));
        assert_eq!(conn.establish_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_lifecycle() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Transmitter);
        conn.configure();
        assert_eq!(conn.state(), State::Configured);
        conn.establish(&ctx).unwrap();
        assert_eq!(conn.state(), State::Active);
        conn.suspend(&ctx).unwrap();
        assert_eq!(conn.state(), State::Suspended);
        conn.resume(&ctx).unwrap();
        assert_eq!(conn.state(), State::Active);
        conn.shutdown(&ctx).unwrap();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_duplicate_establish_is_already_initialized() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.configure();
        conn.establish(&ctx).unwrap();
        let err = conn.establish(&ctx).err().unwrap();
        assert!(matches!(err, TransportError::AlreadyInitialized));
        assert_eq!(conn.state(), State::Active);
        assert_eq!(conn.establish_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_establish_failure_closes() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.configure();
        conn.fail_establish.store(true, Ordering::SeqCst);
        let err = conn.establish(&ctx).err().unwrap();
        assert!(matches!(err, TransportError::InitializationFailed { .. }));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_shutdown_idempotent() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.configure();
        conn.establish(&ctx).unwrap();
        conn.shutdown(&ctx).unwrap();
        conn.shutdown(&ctx).unwrap();
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_legal_from_any_non_terminal_state() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.shutdown(&ctx).unwrap();
        assert_eq!(conn.state(), State::Closed);
        // Hook still runs for a never-established connection.
        assert_eq!(conn.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suspend_requires_active() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.configure();
        assert!(matches!(
            conn.suspend(&ctx).err().unwrap(),
            TransportError::WrongState { .. }
        ));
    }

    #[test]
    fn test_resume_requires_suspended() {
        let ctx = Context::background();
        let conn = ScriptedConnection::new(Kind::Receiver);
        conn.configure();
        conn.establish(&ctx).unwrap();
        assert!(matches!(
            conn.resume(&ctx).err().unwrap(),
            TransportError::WrongState { .. }
        ));
    }

    #[test]
    fn test_state_display_names() {
        assert_eq!(State::NotConfigured.to_string(), "not_configured");
        assert_eq!(State::Closed.to_string(), "closed");
        assert_eq!(Kind::Transmitter.to_string(), "transmitter");
    }
}
