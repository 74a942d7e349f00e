// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diagnostic event hub and runtime debug-category mask.
//!
//! Subsystems publish typed events; observers (console sessions, the agent's
//! log tail, tests) subscribe and get a dedicated bounded ring. Publishing is
//! non-blocking and lossy per subscriber: a full ring drops the event for
//! that subscriber only. System observers should subscribe with a generous
//! capacity.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Debug category: storage engine and sector pool.
pub const DBG_STORAGE: u32 = 0x0001;
/// Debug category: disk spillover.
pub const DBG_SPOOL: u32 = 0x0002;
/// Debug category: network interface manager.
pub const DBG_NET: u32 = 0x0004;
/// Debug category: cellular supervisor and AT exchanges.
pub const DBG_CELL: u32 = 0x0008;
/// Debug category: PPP log inference.
pub const DBG_PPP: u32 = 0x0010;
/// Debug category: scheduler breadcrumbs.
pub const DBG_SCHED: u32 = 0x0020;

static DEBUG_MASK: AtomicU32 = AtomicU32::new(0);

/// Replace the debug category mask (console `debug <hex-mask>`).
pub fn set_debug_mask(mask: u32) {
    DEBUG_MASK.store(mask, Ordering::Relaxed);
}

/// Current debug category mask.
pub fn debug_mask() -> u32 {
    DEBUG_MASK.load(Ordering::Relaxed)
}

/// True when the given category bit is enabled.
#[inline]
pub fn debug_enabled(category: u32) -> bool {
    DEBUG_MASK.load(Ordering::Relaxed) & category != 0
}

/// Debug-category-gated log line.
///
/// Expands to a `log::debug!` guarded by the runtime mask, so disabled
/// categories cost one relaxed atomic load.
#[macro_export]
macro_rules! diag_debug {
    ($cat:expr, $($arg:tt)*) => {
        if $crate::diag::debug_enabled($cat) {
            log::debug!($($arg)*);
        }
    };
}

/// Events published on the diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagEvent {
    /// Pool usage crossed a 10-percentage-point threshold.
    PoolThreshold { threshold_pct: u8, usage_pct: u8 },
    /// A pending window was opened by a bulk read.
    PendingOpened { source: u8, sensor: u16, count: u32 },
    /// One sector had record slots erased on the ACK path.
    SectorErased { sensor: u16, sector: u32 },
    /// A completely empty sector was unlinked from its chain and freed.
    ChainUnlinked { sensor: u16, sector: u32 },
    /// An ACK completed; `erased` records left the store for good.
    EraseDone { source: u8, sensor: u16, erased: u32 },
    /// A NACK rewound the read cursor; the pending window is preserved.
    RevertDone { source: u8, sensor: u16, pending: u32 },
    /// Records were spilled to a per-source disk file.
    SpillFrame { source: u8, sensor: u16, records: u16 },
    /// A fully acknowledged spillover file was deleted.
    SpoolFileDeleted { source: u8, ordinal: u64 },
    /// The network manager moved between states.
    NetStateChanged { from: &'static str, to: &'static str },
    /// A probe finished and produced a score for an interface.
    IfaceScore { iface: u8, score: u8 },
    /// A new uplink interface was selected.
    IfaceSelected { iface: u8 },
    /// Hysteresis suppressed an interface switch.
    SwitchSuppressed { held_iface: u8 },
    /// The cellular supervisor moved between states.
    CellStateChanged { from: &'static str, to: &'static str },
    /// The inferred PPP link state changed; `since_ms` is time in the
    /// previous state.
    PppStateChanged {
        from: &'static str,
        to: &'static str,
        since_ms: u64,
    },
    /// Cellular readiness edge.
    CellReady { ready: bool },
}

/// Broadcast hub: many publishers, N independent bounded subscribers.
pub struct Hub {
    subscribers: Mutex<Vec<Sender<DiagEvent>>>,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe with a bounded ring of `cap` events.
    ///
    /// Subscribers should drain frequently; a full ring drops events for
    /// that subscriber only.
    pub fn subscribe(&self, cap: usize) -> Receiver<DiagEvent> {
        let (tx, rx) = bounded(cap);
        let mut subs = match self.subscribers.lock() {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("[Hub::subscribe] subscribers lock poisoned, recovering");
                e.into_inner()
            }
        };
        subs.push(tx);
        rx
    }

    /// Number of live subscribers (disconnected receivers are pruned on the
    /// next publish).
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(lock) => lock.len(),
            Err(e) => e.into_inner().len(),
        }
    }

    /// Broadcast an event to every subscriber, dropping on full rings.
    pub fn publish(&self, event: &DiagEvent) {
        let mut subs = match self.subscribers.lock() {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("[Hub::publish] subscribers lock poisoned, recovering");
                e.into_inner()
            }
        };

        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true, // lossy for this subscriber
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
