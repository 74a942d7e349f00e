// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! One flat enum covering every failure the core can report, grouped by the
//! subsystem it originates from. Binaries wrap this in `anyhow`; inside the
//! crate it is propagated with `?`.

use crate::storage::sector::SectorId;

/// Errors returned by TGW core operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Storage Errors
    // ========================================================================
    /// The sector pool has no free sectors left.
    PoolFull,
    /// Pool full and disk spillover unavailable (or it freed nothing).
    OutOfStorage,
    /// A sector ID was out of range or not currently allocated.
    InvalidSector(u32),
    /// A chain walk met a link that does not belong to the chain; the sensor
    /// is quarantined.
    ChainCorruption(u16),
    /// No sensor is registered under this ID.
    SensorUnknown(u16),
    /// The sensor's chain was quarantined after corruption; writes rejected.
    SensorDegraded(u16),
    /// Spillover disk I/O failed.
    DiskIo(std::io::Error),
    /// A spillover frame failed its CRC check.
    DiskFrameCrc { file: String, frame: usize },

    // ========================================================================
    // Network Manager Errors
    // ========================================================================
    /// A connectivity probe could not be launched or completed.
    ProbeFailed(String),
    /// The requested interface is not usable for uplink traffic.
    InterfaceDown(String),

    // ========================================================================
    // Cellular / PPP Errors
    // ========================================================================
    /// An AT command exchange exceeded its deadline.
    ModemTimeout,
    /// The PPP chat script reported failure before a carrier was raised.
    ChatFailed,
    /// The modem reported NO CARRIER (or the log showed a hangup).
    NoCarrier,
    /// LCP negotiation did not complete in time.
    LcpTimeout,
    /// IPCP negotiation did not complete in time.
    IpcpTimeout,
    /// PAP/CHAP authentication was rejected by the network.
    AuthFailed,
    /// The PPP daemon exited while the link was supposed to be up.
    PppDaemonDied,

    // ========================================================================
    // Configuration / Console Errors
    // ========================================================================
    /// Configuration failed validation; fatal at startup.
    ConfigInvalid(String),
    /// Console server could not bind its listen socket.
    BindFailed(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Storage
            Error::PoolFull => write!(f, "Sector pool exhausted"),
            Error::OutOfStorage => write!(f, "Out of storage: pool full and spillover unavailable"),
            Error::InvalidSector(id) => write!(f, "Invalid sector id: {}", id),
            Error::ChainCorruption(sensor) => {
                write!(f, "Chain corruption on sensor {} (quarantined)", sensor)
            }
            Error::SensorUnknown(id) => write!(f, "Unknown sensor id: {}", id),
            Error::SensorDegraded(id) => write!(f, "Sensor {} is degraded, write rejected", id),
            Error::DiskIo(e) => write!(f, "Spillover I/O error: {}", e),
            Error::DiskFrameCrc { file, frame } => {
                write!(f, "CRC mismatch in {} frame {}", file, frame)
            }
            // Network
            Error::ProbeFailed(msg) => write!(f, "Probe failed: {}", msg),
            Error::InterfaceDown(name) => write!(f, "Interface down: {}", name),
            // Cellular
            Error::ModemTimeout => write!(f, "Modem AT command timeout"),
            Error::ChatFailed => write!(f, "PPP chat script failed"),
            Error::NoCarrier => write!(f, "No carrier"),
            Error::LcpTimeout => write!(f, "LCP negotiation timeout"),
            Error::IpcpTimeout => write!(f, "IPCP negotiation timeout"),
            Error::AuthFailed => write!(f, "PPP authentication failed"),
            Error::PppDaemonDied => write!(f, "PPP daemon died"),
            // Configuration / console
            Error::ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DiskIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::DiskIo(e)
    }
}

impl Error {
    /// Convenience for APIs that carry a `SectorId` but report the raw value.
    pub(crate) fn invalid_sector(id: SectorId) -> Self {
        Error::InvalidSector(id.raw() as u32)
    }
}

/// Convenient alias for core results.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_storage_errors() {
        assert_eq!(Error::PoolFull.to_string(), "Sector pool exhausted");
        assert!(Error::ChainCorruption(7).to_string().contains("sensor 7"));
        let crc = Error::DiskFrameCrc {
            file: "00000004.mm2".into(),
            frame: 12,
        };
        assert!(crc.to_string().contains("frame 12"));
    }

    #[test]
    fn test_io_source_preserved() {
        use std::error::Error as _;
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::from(inner);
        assert!(err.source().is_some());
    }
}
