// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Uplink interface identities and per-interface live state.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::Instant;

/// The closed set of uplink interface kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IfaceKind {
    Ethernet,
    Wifi,
    /// Cellular over PPP; selectable only while the supervisor reports
    /// readiness.
    Cellular,
}

impl IfaceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IfaceKind::Ethernet => "ethernet",
            IfaceKind::Wifi => "wifi",
            IfaceKind::Cellular => "cellular",
        }
    }

    /// Stable index for diagnostics.
    pub fn index(self) -> u8 {
        match self {
            IfaceKind::Ethernet => 0,
            IfaceKind::Wifi => 1,
            IfaceKind::Cellular => 2,
        }
    }
}

impl std::fmt::Display for IfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static per-interface configuration.
#[derive(Debug, Clone)]
pub struct IfaceConfig {
    pub kind: IfaceKind,
    /// OS device name (`eth0`, `wlan0`, `ppp0`).
    pub os_name: String,
    /// Selection priority; lower wins ties.
    pub priority: u8,
    /// Interface serves DHCP to downstream clients: never probed, never
    /// selected, never cooled down.
    pub dhcp_server: bool,
}

impl IfaceConfig {
    pub fn new(kind: IfaceKind, os_name: impl Into<String>, priority: u8) -> Self {
        Self {
            kind,
            os_name: os_name.into(),
            priority,
            dhcp_server: false,
        }
    }

    /// Mark the interface as a local DHCP server.
    pub fn dhcp_server(mut self) -> Self {
        self.dhcp_server = true;
        self
    }
}

/// Mutable per-interface state, one lock per interface.
#[derive(Debug, Default)]
pub struct IfaceStatus {
    /// Last probe score (0-10), `None` before the first probe.
    pub score: Option<u8>,
    pub last_probe: Option<Instant>,
    /// Currently selected as the uplink.
    pub active: bool,
    /// Excluded from selection until this instant (failed health check).
    pub cooldown_until: Option<Instant>,
    /// Local address reported by the last probe.
    pub local_ip: Option<IpAddr>,
    /// A probe is in flight.
    pub probing: bool,
}

/// Configuration plus lock-guarded live state.
pub struct IfaceEntry {
    pub cfg: IfaceConfig,
    pub status: Mutex<IfaceStatus>,
}

impl IfaceEntry {
    pub fn new(cfg: IfaceConfig) -> Self {
        Self {
            cfg,
            status: Mutex::new(IfaceStatus::default()),
        }
    }

    /// True when the cooldown (if any) has passed.
    pub fn cooled_down(&self, now: Instant) -> bool {
        self.status
            .lock()
            .cooldown_until
            .map_or(true, |until| now >= until)
    }
}
