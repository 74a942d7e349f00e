// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration structs.
//!
//! The core consumes an already-parsed configuration; file formats and
//! loaders live with the agent. Every struct has workable defaults and a
//! `GatewayConfig::validate()` that rejects nonsense before any component
//! is built (invalid configuration is fatal at startup).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::iface::{IfaceConfig, IfaceKind};
use crate::storage::sector::SectorKind;

/// Logical consumer identity under which read cursors and pending windows
/// are tracked. Closed enumeration, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadSource {
    /// The primary cloud gateway uploader.
    Gateway = 0,
    /// A hosted-device relay consuming on behalf of attached hardware.
    HostedDevice = 1,
    /// The CAN bus exporter.
    CanBus = 2,
    /// Local mass-storage archiver.
    LocalStorage = 3,
}

impl UploadSource {
    /// Number of upload sources (array dimension for per-source tracking).
    pub const COUNT: usize = 4;

    /// All sources, in index order.
    pub const ALL: [UploadSource; Self::COUNT] = [
        UploadSource::Gateway,
        UploadSource::HostedDevice,
        UploadSource::CanBus,
        UploadSource::LocalStorage,
    ];

    /// Stable index into per-source tracking arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`UploadSource::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Spool directory name for this source.
    pub fn as_str(self) -> &'static str {
        match self {
            UploadSource::Gateway => "gateway",
            UploadSource::HostedDevice => "hosted",
            UploadSource::CanBus => "canbus",
            UploadSource::LocalStorage => "local",
        }
    }
}

impl std::fmt::Display for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of upload sources consuming a given sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMask(u8);

impl SourceMask {
    /// Empty mask (sensor consumed by nobody; rejected by validation).
    pub const EMPTY: SourceMask = SourceMask(0);

    /// Mask containing every source.
    pub fn all() -> Self {
        let mut mask = 0u8;
        for s in UploadSource::ALL {
            mask |= 1 << s.index();
        }
        SourceMask(mask)
    }

    /// Mask from an explicit source list.
    pub fn of(sources: &[UploadSource]) -> Self {
        let mut mask = 0u8;
        for s in sources {
            mask |= 1 << s.index();
        }
        SourceMask(mask)
    }

    #[inline]
    pub fn contains(self, source: UploadSource) -> bool {
        self.0 & (1 << source.index()) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the sources present in the mask, in index order.
    pub fn iter(self) -> impl Iterator<Item = UploadSource> {
        UploadSource::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

/// Per-sensor configuration entry.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Sensor identifier; also its index in the sensor arena.
    pub id: u16,
    /// Human-readable name for the console.
    pub name: String,
    /// TSD (packed time-series) or EVT (explicit-timestamp events).
    pub kind: SectorKind,
    /// Inter-sample period in milliseconds (TSD timestamp reconstruction).
    pub period_ms: u32,
    /// Upload sources that consume this sensor.
    pub sources: SourceMask,
}

impl SensorConfig {
    /// A TSD sensor consumed by the given sources.
    pub fn tsd(id: u16, name: impl Into<String>, period_ms: u32, sources: SourceMask) -> Self {
        Self {
            id,
            name: name.into(),
            kind: SectorKind::Tsd,
            period_ms,
            sources,
        }
    }

    /// An EVT sensor consumed by the given sources.
    pub fn evt(id: u16, name: impl Into<String>, sources: SourceMask) -> Self {
        Self {
            id,
            name: name.into(),
            kind: SectorKind::Evt,
            period_ms: 0,
            sources,
        }
    }
}

/// The four GPS companion sensors written by `write_evt_with_gps`.
#[derive(Debug, Clone, Copy)]
pub struct GpsSensors {
    pub latitude: u16,
    pub longitude: u16,
    pub altitude: u16,
    pub speed: u16,
}

impl GpsSensors {
    pub fn ids(&self) -> [u16; 4] {
        [self.latitude, self.longitude, self.altitude, self.speed]
    }
}

/// Storage engine and spillover configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// RAM pool capacity in sectors.
    pub pool_sectors: usize,
    /// Pool usage percent above which the engine spills chains to disk.
    pub high_water_pct: u8,
    /// Spill passes run until usage drops to this percent.
    pub spill_target_pct: u8,
    /// Spillover directory (per-source subdirectories are created inside).
    pub spool_dir: PathBuf,
    /// Spool files are sealed once they reach this many bytes.
    pub spool_file_cap_bytes: u64,
    /// Disk spillover on/off (off on diskless targets).
    pub spool_enabled: bool,
    /// Grace period for the shutdown flush.
    pub shutdown_grace: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_sectors: 4096,
            high_water_pct: 80,
            spill_target_pct: 70,
            spool_dir: PathBuf::from("/var/spool/tgw"),
            spool_file_cap_bytes: 64 * 1024,
            spool_enabled: true,
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// Network interface manager configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Candidate uplink interfaces with priorities and roles.
    pub interfaces: Vec<IfaceConfig>,
    /// Round trips per probe.
    pub probe_rounds: u32,
    /// Per-round-trip reply timeout.
    pub probe_round_timeout: Duration,
    /// Global deadline for a probe wave before reviewing partial results.
    pub probe_deadline: Duration,
    /// Probe anchor host (an echo responder near the cloud endpoint).
    pub anchor_host: String,
    /// Probe anchor UDP port.
    pub anchor_port: u16,
    /// Minimum score to consider an interface usable at all.
    pub min_acceptable: u8,
    /// Score at which a higher-priority interface wins outright.
    pub good_available: u8,
    /// Interval between full rescans while online.
    pub rescan_interval: Duration,
    /// Interval between health probes of the active interface.
    pub health_interval: Duration,
    /// Sliding window for switch hysteresis.
    pub switch_window: Duration,
    /// Switches tolerated inside the window before cooldown.
    pub switch_window_max: usize,
    /// Cooldown once the window cap is hit; no rebinds until expiry.
    pub switch_cooldown: Duration,
    /// Per-interface cooldown after a failed health check.
    pub iface_cooldown: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            probe_rounds: 10,
            probe_round_timeout: Duration::from_millis(750),
            probe_deadline: Duration::from_secs(15),
            anchor_host: String::new(),
            anchor_port: 7,
            min_acceptable: 3,
            good_available: 7,
            rescan_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(10),
            switch_window: Duration::from_secs(60),
            switch_window_max: 5,
            switch_cooldown: Duration::from_secs(120),
            iface_cooldown: Duration::from_secs(60),
        }
    }
}

/// Cellular/PPP supervisor configuration.
#[derive(Debug, Clone)]
pub struct CellConfig {
    /// Modem AT command port.
    pub modem_device: String,
    /// Serial baud rate.
    pub baud: u32,
    /// Shell entry point that starts pppd with the unit's options.
    ///
    /// The plain `pon` path is deliberately not used: it depends on peer
    /// files that are not guaranteed to exist on field units.
    pub ppp_start_script: String,
    /// PPP daemon log file tailed for state inference.
    pub ppp_log_path: PathBuf,
    /// pppd pid file used for liveness checks and signalling.
    pub ppp_pidfile: PathBuf,
    /// Stale lock files removed after a forced stop.
    pub lock_files: Vec<PathBuf>,
    /// Configure SMS text mode during modem init.
    pub sms_text_mode: bool,
    /// Per-AT-command exchange deadline.
    pub at_timeout: Duration,
    /// Overall registration wait before falling back to a carrier scan.
    pub registration_timeout: Duration,
    /// Carrier scan (AT+COPS=?) deadline.
    pub scan_timeout: Duration,
    /// PPP bring-up deadline (chat through IPCP).
    pub connect_timeout: Duration,
    /// Consecutive PPP failures before a carrier is blacklisted.
    pub blacklist_threshold: u32,
    /// Retry backoff ladder applied in `Disconnected`.
    pub retry_backoff: [Duration; 3],
    /// Protection gate: minimum online time before auto-rescan is allowed
    /// to consider the connection expendable.
    pub protect_min_online: Duration,
    /// Protection gate: minimum consecutive health passes.
    pub protect_min_passes: u32,
    /// Protection gate: window after connect during which a healthy link
    /// blocks automatic rescans.
    pub protect_window: Duration,
    /// Grace given to pppd between the polite stop and the forced kill.
    pub stop_grace: Duration,
    /// Interval between PPP health evaluations while online.
    pub health_interval: Duration,
    /// Software failures tolerated before a GPIO power cycle of the modem.
    pub hardware_reset_threshold: u32,
    /// Sysfs GPIO value path driving the modem reset line, if wired.
    pub gpio_reset_path: Option<PathBuf>,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            modem_device: "/dev/ttyUSB2".into(),
            baud: 115_200,
            ppp_start_script: "/etc/start_pppd.sh".into(),
            ppp_log_path: PathBuf::from("/var/log/ppp.log"),
            ppp_pidfile: PathBuf::from("/var/run/ppp0.pid"),
            lock_files: vec![PathBuf::from("/var/lock/LCK..ttyUSB2")],
            sms_text_mode: false,
            at_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(60),
            scan_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(90),
            blacklist_threshold: 3,
            retry_backoff: [
                Duration::from_secs(5),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
            protect_min_online: Duration::from_secs(30),
            protect_min_passes: 2,
            protect_window: Duration::from_secs(300),
            stop_grace: Duration::from_secs(2),
            health_interval: Duration::from_secs(10),
            hardware_reset_threshold: 6,
            gpio_reset_path: None,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub sensors: Vec<SensorConfig>,
    /// GPS companion sensors for `write_evt_with_gps`, if a GPS provider
    /// is attached.
    pub gps: Option<GpsSensors>,
    pub storage: StorageConfig,
    pub net: NetConfig,
    pub cell: CellConfig,
    /// Console bind address.
    pub console_bind: String,
    /// Console TCP port (0 disables the console server).
    pub console_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sensors: Vec::new(),
            gps: None,
            storage: StorageConfig::default(),
            net: NetConfig::default(),
            cell: CellConfig::default(),
            console_bind: "127.0.0.1".into(),
            console_port: 4245,
        }
    }
}

impl GatewayConfig {
    /// Fluent sensor registration.
    pub fn with_sensor(mut self, sensor: SensorConfig) -> Self {
        self.sensors.push(sensor);
        self
    }

    /// Fluent interface registration.
    pub fn with_interface(mut self, iface: IfaceConfig) -> Self {
        self.net.interfaces.push(iface);
        self
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sensors.is_empty() {
            return Err(Error::ConfigInvalid("no sensors configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.sensors {
            if !seen.insert(s.id) {
                return Err(Error::ConfigInvalid(format!("duplicate sensor id {}", s.id)));
            }
            if s.sources.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "sensor {} has no upload sources",
                    s.id
                )));
            }
            if s.kind == SectorKind::Tsd && s.period_ms == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "TSD sensor {} needs a non-zero sampling period",
                    s.id
                )));
            }
        }

        if let Some(gps) = &self.gps {
            for id in gps.ids() {
                let Some(cfg) = self.sensors.iter().find(|s| s.id == id) else {
                    return Err(Error::ConfigInvalid(format!(
                        "GPS companion sensor {} is not configured",
                        id
                    )));
                };
                if cfg.kind != SectorKind::Evt {
                    return Err(Error::ConfigInvalid(format!(
                        "GPS companion sensor {} must be an EVT sensor",
                        id
                    )));
                }
            }
        }

        if self.storage.pool_sectors == 0 {
            return Err(Error::ConfigInvalid("pool size must be non-zero".into()));
        }
        if self.storage.high_water_pct < 50 || self.storage.high_water_pct > 95 {
            return Err(Error::ConfigInvalid(
                "high-water mark must be within 50..=95 percent".into(),
            ));
        }
        if self.storage.spill_target_pct >= self.storage.high_water_pct {
            return Err(Error::ConfigInvalid(
                "spill target must be below the high-water mark".into(),
            ));
        }

        if self.net.interfaces.is_empty() {
            return Err(Error::ConfigInvalid("no uplink interfaces configured".into()));
        }
        let mut kinds = std::collections::HashSet::new();
        for i in &self.net.interfaces {
            if !kinds.insert(i.kind) {
                return Err(Error::ConfigInvalid(format!(
                    "interface kind {:?} configured twice",
                    i.kind
                )));
            }
        }
        let uplink_capable = self.net.interfaces.iter().any(|i| !i.dhcp_server);
        if !uplink_capable {
            return Err(Error::ConfigInvalid(
                "every interface is a DHCP server; no uplink candidate remains".into(),
            ));
        }
        if self.net.probe_rounds == 0 {
            return Err(Error::ConfigInvalid("probe rounds must be non-zero".into()));
        }
        if self.net.anchor_host.is_empty() {
            return Err(Error::ConfigInvalid("probe anchor host is empty".into()));
        }
        if self.net.min_acceptable > 10 || self.net.good_available > 10 {
            return Err(Error::ConfigInvalid("scores are bounded by 10".into()));
        }

        // Cellular checks only matter when a cellular interface exists.
        if self
            .net
            .interfaces
            .iter()
            .any(|i| i.kind == IfaceKind::Cellular)
        {
            if self.cell.modem_device.is_empty() {
                return Err(Error::ConfigInvalid("modem device path is empty".into()));
            }
            if self.cell.ppp_start_script.is_empty() {
                return Err(Error::ConfigInvalid("PPP start script path is empty".into()));
            }
        }

        Ok(())
    }

    /// Look up a sensor entry by id.
    pub fn sensor(&self, id: u16) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.id == id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
