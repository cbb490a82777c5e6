//! 1:1 producer-to-consumer linkage between connections.
//!
//! A link is a non-owning, unidirectional binding: the producer holds a
//! weak handle to its sink, and the sink holds a weak back-reference for
//! bookkeeping. Either peer may be dropped independently; delivery through
//! a dangling link degrades to a logged drop rather than undefined
//! behavior.

use std::sync::Arc;

use tracing::debug;

use crate::connection::{Connection, State};
use crate::context::Context;
use crate::error::{Result, TransportError};

/// Bind `producer`'s output to `consumer`. Legal in any non-terminal state
/// of both peers.
pub fn link(
    _ctx: &Context,
    producer: &Arc<dyn Connection>,
    consumer: &Arc<dyn Connection>,
) -> Result<()> {
    if producer.state() == State::Closed {
        return Err(TransportError::wrong_state("set_link", producer.state()));
    }
    if consumer.state() == State::Closed {
        return Err(TransportError::wrong_state("set_link", consumer.state()));
    }
    producer.core().set_sink(Arc::downgrade(consumer));
    consumer.core().set_source(Arc::downgrade(producer));
    debug!(producer = %producer.kind(), consumer = %consumer.kind(), "connections linked");
    Ok(())
}

/// Remove `producer`'s link, clearing the sink's back-reference as well.
pub fn unlink(_ctx: &Context, producer: &Arc<dyn Connection>) {
    if let Some(sink) = producer.core().sink() {
        sink.core().set_source(std::sync::Weak::<Unlinked>::new());
    }
    producer
        .core()
        .set_sink(std::sync::Weak::<Unlinked>::new());
    debug!(producer = %producer.kind(), "connection unlinked");
}

struct Unlinked;

impl Connection for Unlinked {
    fn core(&self) -> &crate::connection::ConnectionCore {
        unreachable!("placeholder type is never instantiated")
    }

    fn on_establish(&self, _ctx: &Context) -> Result<()> {
        unreachable!("placeholder type is never instantiated")
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        unreachable!("placeholder type is never instantiated")
    }
}
