#![warn(missing_docs)]

//! Mediamesh connection core: move opaque fixed-size frames between
//! endpoints at line rate, without copies where possible.
//!
//! This crate provides the data-plane connection layer of the mediamesh
//! proxy:
//! - A generic connection state machine with composable producer→consumer
//!   linking and cancellation-aware shutdown
//! - A fixed-count, fabric-registered buffer pool carved from one
//!   page-aligned allocation
//! - An RDMA-style transport over a verbs-like fabric façade, with a
//!   completion-polling worker and a buffer-processing worker per
//!   connection
//! - An in-process loopback fabric for running and testing the transport
//!   without RDMA hardware

pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod fabric;
pub mod fabric_hw;
pub mod fabric_sim;
pub mod link;
pub mod metrics;
mod rdma;
pub mod rdma_rx;
pub mod rdma_tx;

pub use buffer::{BufferPool, BufferPoolStats, FrameLease, PooledBuffer};
pub use config::RdmaConnectionConfig;
pub use connection::{Connection, ConnectionCore, Kind, State};
pub use context::{CancelHandle, Context, SleepOutcome, WaitOutcome};
pub use error::{Result, TransportError};
pub use fabric::{
    CqEvent, EndpointConfig, EndpointRole, FabricDevice, FabricEndpoint, FabricProvider, MrHandle,
};
pub use fabric_hw::{HwFabric, HwFabricConfig};
pub use fabric_sim::{SimFabric, SimFabricConfig, SimFabricStats};
pub use link::{link, unlink};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use rdma_rx::RdmaRx;
pub use rdma_tx::RdmaTx;
