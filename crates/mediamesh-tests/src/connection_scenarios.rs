//! Lifecycle scenarios for the RDMA connections, driven through the real
//! public API against the loopback fabric with failure injection.

use std::sync::Arc;

use mediamesh_transport::{
    Connection, Context, RdmaRx, SimFabric, SimFabricConfig, State, TransportError,
};

use crate::harness::{rx_config, TEST_DEV_PORT};

fn configured_rx(fabric: &Arc<SimFabric>) -> (Context, Arc<RdmaRx>) {
    let ctx = Context::background();
    let rx = RdmaRx::new();
    rx.configure(&ctx, rx_config(1024, 8), TEST_DEV_PORT, fabric.clone())
        .unwrap();
    assert_eq!(rx.state(), State::Configured);
    (ctx, rx)
}

#[test]
fn test_happy_path_establish_shutdown() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let (ctx, rx) = configured_rx(&fabric);

    rx.establish(&ctx).unwrap();
    assert_eq!(rx.state(), State::Active);
    let stats = rx.pool_stats().unwrap();
    assert_eq!(stats.capacity, 8);
    // Every buffer starts out posted to the fabric.
    assert_eq!(stats.available, 0);
    assert_eq!(fabric.stats().recvs_posted, 8);

    rx.shutdown(&ctx).unwrap();
    assert_eq!(rx.state(), State::Closed);
    assert!(rx.pool_stats().is_none());
    assert_eq!(fabric.stats().endpoints_destroyed, 1);
}

#[test]
fn test_establish_fails_at_endpoint_init() {
    let fabric = SimFabric::new(SimFabricConfig {
        fail_endpoint_init: true,
        ..SimFabricConfig::default()
    });
    let (ctx, rx) = configured_rx(&fabric);

    let err = rx.establish(&ctx).err().unwrap();
    assert!(matches!(err, TransportError::InitializationFailed { .. }));
    assert_eq!(rx.state(), State::Closed);
    // Failure happened before any registration was attempted.
    assert_eq!(fabric.stats().registrations, 0);
}

#[test]
fn test_establish_fails_at_memory_registration() {
    let fabric = SimFabric::new(SimFabricConfig {
        fail_register_at: Some(0),
        ..SimFabricConfig::default()
    });
    let (ctx, rx) = configured_rx(&fabric);

    let err = rx.establish(&ctx).err().unwrap();
    assert!(matches!(
        err,
        TransportError::MemoryRegistrationFailed { .. }
    ));
    assert_eq!(rx.state(), State::Closed);
    let stats = fabric.stats();
    assert_eq!(stats.endpoints_created, 1);
    assert_eq!(stats.endpoints_destroyed, 1);
}

#[test]
fn test_establish_fails_partway_through_registration() {
    let fabric = SimFabric::new(SimFabricConfig {
        fail_register_at: Some(3),
        ..SimFabricConfig::default()
    });
    let (ctx, rx) = configured_rx(&fabric);

    let err = rx.establish(&ctx).err().unwrap();
    assert!(matches!(
        err,
        TransportError::MemoryRegistrationFailed { .. }
    ));
    assert_eq!(rx.state(), State::Closed);
    assert_eq!(fabric.stats().endpoints_destroyed, 1);
}

#[test]
fn test_duplicate_establish() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let (ctx, rx) = configured_rx(&fabric);

    rx.establish(&ctx).unwrap();
    assert_eq!(rx.state(), State::Active);

    let err = rx.establish(&ctx).err().unwrap();
    assert!(matches!(err, TransportError::AlreadyInitialized));
    assert_eq!(rx.state(), State::Active);

    rx.shutdown(&ctx).unwrap();
}

#[test]
fn test_state_transition_smoke() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let ctx = Context::background();
    let rx = RdmaRx::new();
    assert_eq!(rx.state(), State::NotConfigured);

    rx.configure(&ctx, rx_config(1 << 20, 8), TEST_DEV_PORT, fabric.clone())
        .unwrap();
    assert_eq!(rx.state(), State::Configured);

    rx.establish(&ctx).unwrap();
    assert_eq!(rx.state(), State::Active);

    rx.suspend(&ctx).unwrap();
    assert_eq!(rx.state(), State::Suspended);

    rx.resume(&ctx).unwrap();
    assert_eq!(rx.state(), State::Active);

    rx.shutdown(&ctx).unwrap();
    assert_eq!(rx.state(), State::Closed);
}

#[test]
fn test_configure_rejects_bad_arguments_without_side_effects() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let ctx = Context::background();
    let rx = RdmaRx::new();

    let mut cfg = rx_config(0, 8);
    let err = rx
        .configure(&ctx, cfg.clone(), TEST_DEV_PORT, fabric.clone())
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::BadArgument { .. }));
    assert_eq!(rx.state(), State::NotConfigured);

    cfg.transfer_size = 1024;
    cfg.queue_depth = 2048;
    assert!(rx
        .configure(&ctx, cfg, TEST_DEV_PORT, fabric.clone())
        .is_err());
    assert_eq!(rx.state(), State::NotConfigured);
}

#[test]
fn test_configure_twice_is_wrong_state() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let (ctx, rx) = configured_rx(&fabric);
    let err = rx
        .configure(&ctx, rx_config(1024, 8), TEST_DEV_PORT, fabric.clone())
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::WrongState { .. }));
}

#[test]
fn test_shutdown_before_establish() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let (ctx, rx) = configured_rx(&fabric);
    rx.shutdown(&ctx).unwrap();
    assert_eq!(rx.state(), State::Closed);
    // Nothing was brought up, so nothing was destroyed.
    assert_eq!(fabric.stats().endpoints_created, 0);
}

#[test]
fn test_establish_after_shutdown_is_wrong_state() {
    let fabric = SimFabric::new(SimFabricConfig::default());
    let (ctx, rx) = configured_rx(&fabric);
    rx.shutdown(&ctx).unwrap();
    let err = rx.establish(&ctx).err().unwrap();
    assert!(matches!(err, TransportError::WrongState { .. }));
    assert_eq!(rx.state(), State::Closed);
}
