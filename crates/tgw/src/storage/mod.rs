// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tiered telemetry storage (the MM2 store).
//!
//! Three layers:
//!
//! - [`pool`] - the bounded RAM sector pool with free-list allocation and
//!   usage threshold reporting,
//! - [`engine`] - per-sensor sector chains, per-upload-source read cursors
//!   and pending windows, the ACK/NACK paths,
//! - [`spool`] - per-source append-only disk files the engine spills the
//!   oldest chain sectors into under pool pressure, with CRC-checked
//!   crash recovery.
//!
//! Locking discipline: per-sensor lock first, pool lock second, spool lock
//! last. The pool lock is never held across a spool call.

pub mod engine;
pub mod pool;
pub mod sector;
pub mod spool;

pub use engine::{GpsFix, GpsProvider, StorageEngine, UtcClock};
pub use pool::SectorPool;
pub use sector::{SectorId, SectorKind};
pub use spool::{DiskSpool, SpoolError};

/// One decoded telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Producing sensor.
    pub sensor: u16,
    /// Raw 32-bit value (fixed-point or `f32::to_bits`, per sensor config).
    pub value: u32,
    /// UTC timestamp in milliseconds.
    pub utc_ms: u64,
}
