// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cellular modem and PPP link supervision.
//!
//! - [`at`] - non-blocking AT command exchanges over a [`ModemPort`]
//! - [`carrier`] - scan parsing, signal scoring, blacklisting
//! - [`ppp_log`] - link state inferred from the daemon's log (data-driven
//!   pattern table, cached reads)
//! - [`pppd`] - daemon lifecycle via the shell entry point and pid file
//! - [`serial`] - raw non-blocking serial port (Unix)
//! - [`supervisor`] - the multi-tick state machine tying it together

pub mod at;
pub mod carrier;
pub mod ppp_log;
pub mod pppd;
pub mod serial;
pub mod supervisor;

pub use at::ModemPort;
pub use carrier::{Blacklist, Carrier};
pub use ppp_log::{FilePppLog, PppEndpoints, PppErrorKind, PppLinkState, PppLogSource};
pub use pppd::{PppController, ShellPppController};
pub use supervisor::{CellCommand, CellShared, CellState, CellStatusSnapshot, CellSupervisor};

#[cfg(unix)]
pub use serial::SerialPort;
