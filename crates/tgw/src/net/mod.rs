// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Uplink interface management.
//!
//! - [`iface`] - interface identities, configuration, per-interface state
//! - [`probe`] - UDP round-trip probes on worker threads
//! - [`manager`] - the selection state machine (scores, hysteresis,
//!   DHCP-server exclusion, cellular gating)

pub mod iface;
pub mod manager;
pub mod probe;

pub use iface::{IfaceConfig, IfaceEntry, IfaceKind, IfaceStatus};
pub use manager::{NetManager, NetShared, NetState, Selection};
pub use probe::{ProbeOutcome, ProbeRequest, Prober, ScriptedProber, UdpProber};
