// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON configuration file for the agent.
//!
//! The core consumes plain structs; this module owns the serde mirror and
//! the mapping. Field units ship a provisioning file like:
//!
//! ```json
//! {
//!   "sensors": [
//!     { "id": 42, "name": "engine_rpm", "kind": "tsd", "period_ms": 250,
//!       "sources": ["gateway"] }
//!   ],
//!   "interfaces": [
//!     { "kind": "ethernet", "os_name": "eth0", "priority": 0 },
//!     { "kind": "wifi", "os_name": "wlan0", "priority": 1,
//!       "dhcp_server": true },
//!     { "kind": "cellular", "os_name": "ppp0", "priority": 2 }
//!   ],
//!   "anchor_host": "probe.example.net"
//! }
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tgw::config::{GatewayConfig, GpsSensors, SensorConfig, SourceMask, UploadSource};
use tgw::net::iface::{IfaceConfig, IfaceKind};
use tgw::storage::SectorKind;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub sensors: Vec<FileSensor>,
    pub interfaces: Vec<FileIface>,
    pub anchor_host: String,
    #[serde(default)]
    pub anchor_port: Option<u16>,
    #[serde(default)]
    pub gps: Option<FileGps>,
    #[serde(default)]
    pub pool_sectors: Option<usize>,
    #[serde(default)]
    pub high_water_pct: Option<u8>,
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    #[serde(default)]
    pub console_port: Option<u16>,
    #[serde(default)]
    pub modem_device: Option<String>,
    #[serde(default)]
    pub ppp_start_script: Option<String>,
    #[serde(default)]
    pub ppp_log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct FileSensor {
    pub id: u16,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub period_ms: u32,
    pub sources: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileIface {
    pub kind: String,
    pub os_name: String,
    pub priority: u8,
    #[serde(default)]
    pub dhcp_server: bool,
}

#[derive(Debug, Deserialize)]
pub struct FileGps {
    pub latitude: u16,
    pub longitude: u16,
    pub altitude: u16,
    pub speed: u16,
}

/// Load and map the provisioning file into the core's configuration.
pub fn load(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: FileConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    into_config(file)
}

fn into_config(file: FileConfig) -> anyhow::Result<GatewayConfig> {
    let mut cfg = GatewayConfig::default();

    for sensor in file.sensors {
        let kind = match sensor.kind.as_str() {
            "tsd" => SectorKind::Tsd,
            "evt" => SectorKind::Evt,
            other => bail!("sensor {}: unknown kind {:?}", sensor.id, other),
        };
        let mut sources = Vec::new();
        for name in &sensor.sources {
            sources.push(parse_source(name).with_context(|| format!("sensor {}", sensor.id))?);
        }
        cfg.sensors.push(SensorConfig {
            id: sensor.id,
            name: sensor.name,
            kind,
            period_ms: sensor.period_ms,
            sources: SourceMask::of(&sources),
        });
    }

    for iface in file.interfaces {
        let kind = match iface.kind.as_str() {
            "ethernet" => IfaceKind::Ethernet,
            "wifi" => IfaceKind::Wifi,
            "cellular" => IfaceKind::Cellular,
            other => bail!("unknown interface kind {:?}", other),
        };
        let mut ic = IfaceConfig::new(kind, iface.os_name, iface.priority);
        if iface.dhcp_server {
            ic = ic.dhcp_server();
        }
        cfg.net.interfaces.push(ic);
    }

    cfg.net.anchor_host = file.anchor_host;
    if let Some(port) = file.anchor_port {
        cfg.net.anchor_port = port;
    }
    if let Some(gps) = file.gps {
        cfg.gps = Some(GpsSensors {
            latitude: gps.latitude,
            longitude: gps.longitude,
            altitude: gps.altitude,
            speed: gps.speed,
        });
    }
    if let Some(sectors) = file.pool_sectors {
        cfg.storage.pool_sectors = sectors;
    }
    if let Some(pct) = file.high_water_pct {
        cfg.storage.high_water_pct = pct;
    }
    if let Some(dir) = file.spool_dir {
        cfg.storage.spool_dir = dir;
    }
    if let Some(port) = file.console_port {
        cfg.console_port = port;
    }
    if let Some(dev) = file.modem_device {
        cfg.cell.modem_device = dev;
    }
    if let Some(script) = file.ppp_start_script {
        cfg.cell.ppp_start_script = script;
    }
    if let Some(path) = file.ppp_log_path {
        cfg.cell.ppp_log_path = path;
    }

    Ok(cfg)
}

fn parse_source(name: &str) -> anyhow::Result<UploadSource> {
    Ok(match name {
        "gateway" => UploadSource::Gateway,
        "hosted" => UploadSource::HostedDevice,
        "canbus" => UploadSource::CanBus,
        "local" => UploadSource::LocalStorage,
        other => bail!("unknown upload source {:?}", other),
    })
}

// ============================================================================
// TESTS
// ============================================================================
