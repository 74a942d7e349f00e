// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Disk spillover scenarios: high-water spill, disk-only acknowledgement
//! with file cleanup, restart recovery, threshold reporting on late
//! attach.

use std::path::Path;
use tgw::config::{GatewayConfig, SensorConfig, SourceMask, UploadSource};
use tgw::diag::DiagEvent;
use tgw::net::iface::{IfaceConfig, IfaceKind};
use tgw::net::probe::ScriptedProber;
use tgw::Gateway;

const HOSTED: UploadSource = UploadSource::HostedDevice;

fn config(pool_sectors: usize, spool_dir: &Path) -> GatewayConfig {
    let mut cfg = GatewayConfig::default()
        .with_sensor(SensorConfig::tsd(7, "coolant_temp", 500, SourceMask::of(&[HOSTED])))
        .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
    cfg.net.anchor_host = "probe.example.net".into();
    cfg.storage.pool_sectors = pool_sectors;
    cfg.storage.spool_dir = spool_dir.to_path_buf();
    cfg.console_port = 0;
    cfg
}

fn gateway(cfg: GatewayConfig) -> Gateway {
    Gateway::build_with(cfg, Box::new(ScriptedProber::new()), None, None, None)
        .expect("gateway builds")
}

fn spool_files(spool_dir: &Path, source: &str) -> Vec<String> {
    let dir = spool_dir.join(source);
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(".mm2"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn test_high_water_spill_and_disk_only_ack() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gateway = gateway(config(10, dir.path()));
    let engine = gateway.engine();

    // Fill past the 80% high-water mark: 54 values = 9 sectors = 90%.
    for i in 0..54u32 {
        engine.write_tsd(7, i).expect("write");
    }
    engine.maintain().expect("maintain");

    // The oldest tail moved to the hosted source's spool.
    assert!(
        !spool_files(dir.path(), "hosted").is_empty(),
        "maintenance spilled to disk"
    );
    assert!(engine.pool().usage_percent() < 80);
    assert_eq!(engine.total_records(7).expect("total"), 54);

    // A small read is served from disk only: pending start stays NONE.
    let records = engine.read_bulk(HOSTED, 7, 6).expect("read");
    assert_eq!(records.len(), 6);
    let values: Vec<u32> = records.iter().map(|r| r.value).collect();
    assert_eq!(values, (0..6).collect::<Vec<u32>>());
    let (start, _) = engine.pending_start(HOSTED, 7).expect("pending start");
    assert!(start.is_none(), "disk-only pending window");

    // ACK decrements totals and the cleanup hook may delete a file once
    // everything in it is acknowledged.
    engine.erase_all_pending(HOSTED, 7).expect("erase");
    assert_eq!(engine.total_records(7).expect("total"), 48);

    // Drain the rest; every spool file must be gone afterwards.
    let rest = engine.read_bulk(HOSTED, 7, 1000).expect("read");
    assert_eq!(rest.len(), 48);
    engine.erase_all_pending(HOSTED, 7).expect("erase");
    assert_eq!(engine.total_records(7).expect("total"), 0);
    assert!(
        spool_files(dir.path(), "hosted").is_empty(),
        "acknowledged spool files deleted"
    );
}

#[test]
fn test_restart_recovery_preserves_backlog() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let gateway = gateway(config(10, dir.path()));
        let engine = gateway.engine();
        for i in 0..30u32 {
            engine.write_tsd(7, i).expect("write");
        }
        engine.flush_all().expect("flush");
        assert_eq!(engine.sector_count(7).expect("chain"), 0);
    }

    // Process restart: recovery rebuilds the per-source disk counts and
    // the records replay in the original order.
    let gateway = gateway(config(10, dir.path()));
    let engine = gateway.engine();
    assert_eq!(engine.total_records(7).expect("total"), 30);

    let records = engine.read_bulk(HOSTED, 7, 100).expect("read");
    let values: Vec<u32> = records.iter().map(|r| r.value).collect();
    assert_eq!(values, (0..30).collect::<Vec<u32>>());

    engine.erase_all_pending(HOSTED, 7).expect("erase");
    assert_eq!(engine.total_records(7).expect("total"), 0);
    assert!(spool_files(dir.path(), "hosted").is_empty());
}

#[test]
fn test_threshold_reporting_on_late_attach() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(200, dir.path());
    cfg.storage.spool_enabled = false;
    let gateway = gateway(cfg);
    let engine = gateway.engine();

    // Pre-fill to 49% with nobody observing.
    for i in 0..(98 * 6) as u32 {
        engine.write_tsd(7, i).expect("write");
    }
    assert_eq!(engine.pool().usage_percent(), 49);

    // Attach the first observer, then allocate once more.
    let rx = gateway.hub().subscribe(64);
    for i in 0..6u32 {
        engine.write_tsd(7, i).expect("write"); // one more sector: 49.5%
    }

    let thresholds: Vec<u8> = rx
        .try_iter()
        .filter_map(|ev| match ev {
            DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
            _ => None,
        })
        .collect();
    assert_eq!(thresholds, vec![10, 20, 30, 40]);

    // The next 10% boundary yields exactly one more event.
    for i in 0..6u32 {
        engine.write_tsd(7, i).expect("write"); // 100th sector: 50%
    }
    let thresholds: Vec<u8> = rx
        .try_iter()
        .filter_map(|ev| match ev {
            DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
            _ => None,
        })
        .collect();
    assert_eq!(thresholds, vec![50]);
}
