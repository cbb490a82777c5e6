//! Property tests for the transport pipeline and configuration validation.

use std::time::Duration;

use proptest::prelude::*;

use mediamesh_transport::{Connection, RdmaConnectionConfig};

use crate::harness::loopback_pair;

proptest! {
    // Each case spins up a full worker pipeline; keep the case count modest.
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_roundtrip_byte_identical_in_order(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..=512),
            1..8,
        )
    ) {
        let pair = loopback_pair(512, 4);
        for payload in &payloads {
            pair.tx.transmit(&pair.ctx, payload).unwrap();
        }
        prop_assert!(pair.sink.wait_for(payloads.len(), Duration::from_secs(5)));
        prop_assert_eq!(pair.sink.received(), payloads);

        pair.tx.shutdown(&pair.ctx).unwrap();
        pair.rx.shutdown(&pair.ctx).unwrap();
    }
}

proptest! {
    #[test]
    fn prop_config_validation_matches_bounds(
        transfer_size in 0u32..=(1u32 << 30) + 1024,
        queue_depth in 0u32..=2048,
    ) {
        let cfg = RdmaConnectionConfig {
            local_ip: "192.168.1.10".to_string(),
            local_port: 8001,
            remote_ip: "192.168.1.20".to_string(),
            remote_port: 8002,
            transfer_size,
            queue_depth,
        };
        let valid = transfer_size > 0
            && transfer_size <= (1 << 30)
            && queue_depth >= 1
            && queue_depth <= 1024;
        prop_assert_eq!(cfg.validate().is_ok(), valid);
    }
}
