//! Mediamesh test & validation infrastructure.
//!
//! Reusable test doubles for the connection core plus the scenario and
//! property test suites that exercise a Tx→Rx pair over the in-process
//! loopback fabric.

pub mod harness;

pub use harness::{loopback_pair, loopback_pair_on, CollectingSink, LoopbackPair};

#[cfg(test)]
mod connection_scenarios;
#[cfg(test)]
mod proptest_transport;
