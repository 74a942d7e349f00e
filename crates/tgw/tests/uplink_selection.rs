// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Uplink selection at the gateway level: DHCP-server exclusion, flap
//! suppression, and the cellular readiness gate.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tgw::cell::at::ModemPort;
use tgw::cell::ppp_log::PppLogSource;
use tgw::cell::pppd::PppController;
use tgw::config::{GatewayConfig, SensorConfig, SourceMask, UploadSource};
use tgw::net::iface::{IfaceConfig, IfaceKind};
use tgw::net::probe::ScriptedProber;
use tgw::net::NetState;
use tgw::Gateway;

fn base_config() -> GatewayConfig {
    let mut cfg = GatewayConfig::default().with_sensor(SensorConfig::tsd(
        1,
        "speed",
        100,
        SourceMask::of(&[UploadSource::Gateway]),
    ));
    cfg.net.anchor_host = "probe.example.net".into();
    cfg.storage.pool_sectors = 16;
    cfg.storage.spool_enabled = false;
    cfg.console_port = 0;
    cfg
}

/// Drive the manager through one probe wave.
fn run_wave(gateway: &mut Gateway, now: &mut Instant) {
    for _ in 0..5 {
        gateway.net_mut().tick(*now);
        if gateway.net_mut().state() == NetState::Online {
            break;
        }
    }
}

#[test]
fn test_dhcp_server_interface_is_invisible_to_selection() {
    let mut cfg = base_config()
        .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0).dhcp_server())
        .with_interface(IfaceConfig::new(IfaceKind::Wifi, "wlan0", 1));

    let prober = Arc::new(ScriptedProber::new());
    prober.push(IfaceKind::Ethernet, 10); // would win if it were probed
    prober.push(IfaceKind::Wifi, 8);

    struct Fwd(Arc<ScriptedProber>);
    impl tgw::net::probe::Prober for Fwd {
        fn launch(
            &self,
            req: tgw::net::probe::ProbeRequest,
            tx: crossbeam_channel::Sender<tgw::net::probe::ProbeOutcome>,
        ) {
            self.0.launch(req, tx);
        }
    }

    let mut gateway =
        Gateway::build_with(cfg, Box::new(Fwd(prober)), None, None, None).expect("gateway");

    let mut now = Instant::now();
    run_wave(&mut gateway, &mut now);

    let shared = gateway.net().shared();
    assert_eq!(
        shared.current_interface().map(|s| s.iface),
        Some(IfaceKind::Wifi)
    );
    let eth = &shared.entries()[0];
    let status = eth.status.lock();
    assert!(status.score.is_none(), "never probed");
    assert!(!status.active, "never active");
    assert!(status.cooldown_until.is_none(), "never cooled down");
}

#[test]
fn test_flap_suppression_holds_selection_through_cooldown() {
    let mut cfg = base_config()
        .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0))
        .with_interface(IfaceConfig::new(IfaceKind::Wifi, "wlan0", 1));
    cfg.net.rescan_interval = Duration::from_secs(1);
    cfg.net.switch_window = Duration::from_secs(60);
    cfg.net.switch_window_max = 5;
    cfg.net.switch_cooldown = Duration::from_secs(120);

    let prober = Arc::new(ScriptedProber::new());
    struct Fwd(Arc<ScriptedProber>);
    impl tgw::net::probe::Prober for Fwd {
        fn launch(
            &self,
            req: tgw::net::probe::ProbeRequest,
            tx: crossbeam_channel::Sender<tgw::net::probe::ProbeOutcome>,
        ) {
            self.0.launch(req, tx);
        }
    }
    let mut gateway =
        Gateway::build_with(cfg, Box::new(Fwd(prober.clone())), None, None, None)
            .expect("gateway");

    // Ethernet and wifi alternate between 3 and 8 every wave.
    let mut now = Instant::now();
    let mut flip = false;
    for _ in 0..20 {
        let (eth, wifi) = if flip { (3, 8) } else { (8, 3) };
        prober.push(IfaceKind::Ethernet, eth);
        prober.push(IfaceKind::Wifi, wifi);
        flip = !flip;
        run_wave(&mut gateway, &mut now);
        now += Duration::from_secs(2);
    }

    let shared = gateway.net().shared();
    assert!(
        shared.switch_blocked_until().is_some(),
        "flapping entered switch cooldown"
    );

    // Scores keep alternating, the selection must hold for the cooldown.
    let held = shared.current_interface().map(|s| s.iface);
    for _ in 0..5 {
        let (eth, wifi) = if flip { (3, 8) } else { (8, 3) };
        prober.push(IfaceKind::Ethernet, eth);
        prober.push(IfaceKind::Wifi, wifi);
        flip = !flip;
        run_wave(&mut gateway, &mut now);
        now += Duration::from_secs(2);
        assert_eq!(shared.current_interface().map(|s| s.iface), held);
    }
}

// ----------------------------------------------------------------------
// Cellular readiness gate (needs a mocked supervisor stack)
// ----------------------------------------------------------------------

struct SilentPort;
impl ModemPort for SilentPort {
    fn write_line(&mut self, _line: &str) -> io::Result<()> {
        Ok(())
    }
    fn read_available(&mut self) -> io::Result<String> {
        Ok(String::new())
    }
}

struct UpCtrl;
impl PppController for UpCtrl {
    fn start(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn is_running(&mut self) -> bool {
        true
    }
    fn signal_stop(&mut self) {}
    fn force_kill(&mut self) {}
    fn clean_locks(&mut self) {}
    fn link_local_ip(&mut self) -> Option<IpAddr> {
        Some("10.123.0.2".parse().expect("ip"))
    }
}

struct EmptyLog;
impl PppLogSource for EmptyLog {
    fn read_tail(&mut self, _max: usize) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_cellular_rising_edge_triggers_probe_and_selection() {
    let mut cfg = base_config()
        .with_interface(IfaceConfig::new(IfaceKind::Cellular, "ppp0", 0));
    cfg.net.rescan_interval = Duration::from_secs(3600);

    let prober = Arc::new(ScriptedProber::new());
    prober.push(IfaceKind::Cellular, 9);
    struct Fwd(Arc<ScriptedProber>);
    impl tgw::net::probe::Prober for Fwd {
        fn launch(
            &self,
            req: tgw::net::probe::ProbeRequest,
            tx: crossbeam_channel::Sender<tgw::net::probe::ProbeOutcome>,
        ) {
            self.0.launch(req, tx);
        }
    }

    let mut gateway = Gateway::build_with(
        cfg,
        Box::new(Fwd(prober)),
        Some(Box::new(SilentPort)),
        Some(Box::new(UpCtrl)),
        Some(Box::new(EmptyLog)),
    )
    .expect("gateway");

    let mut now = Instant::now();

    // Cellular not ready yet: nothing must be probed or selected.
    for _ in 0..4 {
        gateway.net_mut().tick(now);
    }
    assert_eq!(gateway.net().current_interface(), None);

    // The supervisor's fast path raises readiness (PPP already up).
    gateway.cell_mut().expect("cell").tick(now);
    assert!(gateway.cell().expect("cell").cellular_ready());

    // Rising edge: the manager re-probes immediately and selects cellular.
    for _ in 0..6 {
        gateway.net_mut().tick(now);
        now += Duration::from_millis(100);
    }
    assert_eq!(
        gateway.net().current_interface(),
        Some(IfaceKind::Cellular)
    );
    let shared = gateway.net().shared();
    let cell_entry = &shared.entries()[0];
    assert!(cell_entry.status.lock().active);
}
