// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # TGW - Vehicular Telematics Gateway Core
//!
//! The long-running core of an embedded Linux telematics gateway: sensor
//! values stream in from vehicle adapters, get buffered durably across a
//! RAM sector pool and disk spillover, and leave for the cloud over
//! whichever uplink is currently healthy.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                       Producer adapters                            |
//! |        CAN / OBD2 / BLE / GPS  ->  write_tsd / write_evt           |
//! +--------------------------------------------------------------------+
//! |                      Storage engine (MM2)                          |
//! |  Sector pool | per-sensor chains | per-source pending windows      |
//! |  Disk spillover (<spool>/<source>/NNNNNNNN.mm2, CRC frames)        |
//! +--------------------------------------------------------------------+
//! |    Network manager            |        Cellular supervisor         |
//! |  probe / score / hysteresis   |  AT machine, carrier scan, pppd    |
//! +--------------------------------------------------------------------+
//! |            Scheduler (~100 ms cooperative tick, breadcrumbs)       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tgw::config::{GatewayConfig, SensorConfig, SourceMask, UploadSource};
//! use tgw::net::iface::{IfaceConfig, IfaceKind};
//!
//! fn main() -> tgw::Result<()> {
//!     let mut cfg = GatewayConfig::default()
//!         .with_sensor(SensorConfig::tsd(
//!             42,
//!             "engine_rpm",
//!             250,
//!             SourceMask::of(&[UploadSource::Gateway]),
//!         ))
//!         .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
//!     cfg.net.anchor_host = "probe.example.net".into();
//!
//!     let gateway = tgw::Gateway::build(cfg)?;
//!     gateway.engine().write_tsd(42, 1800)?;
//!
//!     let records = gateway
//!         .engine()
//!         .read_bulk(UploadSource::Gateway, 42, 100)?;
//!     // ... upload, then:
//!     gateway.engine().erase_all_pending(UploadSource::Gateway, 42)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Gateway`] | Wires the whole core from a [`config::GatewayConfig`] |
//! | [`storage::StorageEngine`] | Tiered store with per-source cursors |
//! | [`net::NetManager`] | Uplink selection state machine |
//! | [`cell::CellSupervisor`] | Modem + PPP supervision |
//! | [`sched::Scheduler`] | The ~100 ms cooperative main loop |
//! | [`diag::Hub`] | Diagnostic event stream |

/// Cellular modem and PPP link supervision.
pub mod cell;
/// Gateway configuration structs and validation.
pub mod config;
/// Operator console: dispatch and TCP server.
pub mod console;
/// Diagnostic event hub and debug category mask.
pub mod diag;
/// Crate-wide error type.
pub mod error;
/// Component wiring.
pub mod gateway;
/// Uplink interface management.
pub mod net;
/// Cooperative main loop and breadcrumbs.
pub mod sched;
/// Tiered telemetry storage (pool, engine, spillover).
pub mod storage;

pub use config::{GatewayConfig, UploadSource};
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use storage::{Record, StorageEngine};

/// Default console TCP port.
pub const CONSOLE_PORT: u16 = 4245;

/// TGW version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
