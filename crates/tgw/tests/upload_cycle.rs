// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end upload cycle through the public API: write, bulk read,
//! ACK/NACK, multi-source sharing.

use tgw::config::{GatewayConfig, SensorConfig, SourceMask, UploadSource};
use tgw::net::iface::{IfaceConfig, IfaceKind};
use tgw::net::probe::ScriptedProber;
use tgw::Gateway;

const GW: UploadSource = UploadSource::Gateway;
const HD: UploadSource = UploadSource::HostedDevice;

fn gateway(pool_sectors: usize) -> Gateway {
    let mut cfg = GatewayConfig::default()
        .with_sensor(SensorConfig::tsd(42, "engine_rpm", 250, SourceMask::of(&[GW])))
        .with_sensor(SensorConfig::tsd(7, "coolant_temp", 1000, SourceMask::of(&[GW, HD])))
        .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
    cfg.net.anchor_host = "probe.example.net".into();
    cfg.storage.pool_sectors = pool_sectors;
    cfg.storage.spool_enabled = false;
    cfg.console_port = 0;

    Gateway::build_with(cfg, Box::new(ScriptedProber::new()), None, None, None)
        .expect("gateway builds")
}

#[test]
fn test_normal_upload_cycle() {
    let gateway = gateway(32);
    let engine = gateway.engine();
    let free_initial = engine.pool().free_sectors();

    // 18 TSD values for sensor 42 under source gateway.
    for i in 0..18u32 {
        engine.write_tsd(42, i * 10).expect("write");
    }

    let records = engine.read_bulk(GW, 42, 100).expect("read");
    assert_eq!(records.len(), 18);
    let values: Vec<u32> = records.iter().map(|r| r.value).collect();
    assert_eq!(values, (0..18).map(|i| i * 10).collect::<Vec<u32>>());

    engine.erase_all_pending(GW, 42).expect("erase");
    assert_eq!(engine.total_records(42).expect("total"), 0);
    assert_eq!(engine.sector_count(42).expect("chain"), 0);
    // 18 values / 6 per TSD sector = 3 sectors returned.
    assert_eq!(engine.pool().free_sectors(), free_initial);
}

#[test]
fn test_nack_then_retry() {
    let gateway = gateway(32);
    let engine = gateway.engine();

    for i in 0..18u32 {
        engine.write_tsd(42, i).expect("write");
    }

    let first = engine.read_bulk(GW, 42, 100).expect("read");
    assert_eq!(first.len(), 18);

    engine.revert_all_pending(GW, 42).expect("revert");
    assert!(!engine.has_pending(GW, 42).expect("pending"));

    // Byte-identical records in the same order.
    let second = engine.read_bulk(GW, 42, 100).expect("read");
    assert_eq!(first, second);

    engine.erase_all_pending(GW, 42).expect("erase");
    assert_eq!(engine.total_records(42).expect("total"), 0);
    assert_eq!(engine.sector_count(42).expect("chain"), 0);
}

#[test]
fn test_two_sources_on_one_sensor() {
    let gateway = gateway(32);
    let engine = gateway.engine();
    let free_initial = engine.pool().free_sectors();

    for i in 0..12u32 {
        engine.write_tsd(7, i).expect("write");
    }

    let a = engine.read_bulk(GW, 7, 100).expect("read A");
    let b = engine.read_bulk(HD, 7, 100).expect("read B");
    assert_eq!(a.len(), 12);
    assert_eq!(a, b, "B's cursor is independent but sees the same data");

    // A acknowledges; B has not - the chain must survive.
    engine.erase_all_pending(GW, 7).expect("erase A");
    assert!(engine.sector_count(7).expect("chain") > 0);

    // B acknowledges; now the sectors come back.
    engine.erase_all_pending(HD, 7).expect("erase B");
    assert_eq!(engine.sector_count(7).expect("chain"), 0);
    assert_eq!(engine.pool().free_sectors(), free_initial);
}

#[test]
fn test_has_pending_tracks_read_erase_revert() {
    let gateway = gateway(32);
    let engine = gateway.engine();

    assert!(!engine.has_pending(GW, 42).expect("pending"));
    engine.write_tsd(42, 1).expect("write");
    assert!(!engine.has_pending(GW, 42).expect("pending"));

    engine.read_bulk(GW, 42, 10).expect("read");
    assert!(engine.has_pending(GW, 42).expect("pending"));

    engine.revert_all_pending(GW, 42).expect("revert");
    assert!(!engine.has_pending(GW, 42).expect("pending"));

    engine.read_bulk(GW, 42, 10).expect("read");
    engine.erase_all_pending(GW, 42).expect("erase");
    assert!(!engine.has_pending(GW, 42).expect("pending"));
}

#[test]
fn test_counter_algebra_over_mixed_sequences() {
    let gateway = gateway(64);
    let engine = gateway.engine();
    let total_sectors = engine.pool().total_sectors();

    let mut written = 0u64;
    let mut erased = 0u64;
    fastrand::seed(42);

    for _ in 0..300 {
        match fastrand::u8(0..4) {
            0 | 1 => {
                engine.write_tsd(42, fastrand::u32(..)).expect("write");
                written += 1;
            }
            2 => {
                engine
                    .read_bulk(GW, 42, fastrand::usize(1..30))
                    .expect("read");
            }
            _ => {
                let pending = u64::from(engine.pending_count(GW, 42).expect("count"));
                engine.erase_all_pending(GW, 42).expect("erase");
                erased += pending;
            }
        }

        assert_eq!(
            engine.total_records(42).expect("total"),
            written - erased,
            "writes minus acknowledged erases"
        );
        let chains: usize = [42u16, 7]
            .iter()
            .map(|s| engine.sector_count(*s).expect("chain") as usize)
            .sum();
        assert_eq!(engine.pool().free_sectors() + chains, total_sectors);
    }
}
