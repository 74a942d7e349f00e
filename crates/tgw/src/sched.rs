// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative main loop.
//!
//! One ~100 ms tick visits storage maintenance, the network manager, and
//! the cellular supervisor. None of them may block: long operations are
//! multi-tick state machines, blocking I/O lives on workers. Breadcrumbs
//! record which subsystem a tick entered last, so a lockup leaves a
//! readable trail, and an overrunning tick is logged with the breadcrumb
//! that caused it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::diag::DBG_SCHED;
use crate::gateway::Gateway;

/// Nominal tick period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Subsystem visited by the tick, for lockup diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breadcrumb {
    Idle = 0,
    Storage = 1,
    Net = 2,
    Cell = 3,
}

impl Breadcrumb {
    fn from_u8(v: u8) -> Breadcrumb {
        match v {
            1 => Breadcrumb::Storage,
            2 => Breadcrumb::Net,
            3 => Breadcrumb::Cell,
            _ => Breadcrumb::Idle,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Breadcrumb::Idle => "idle",
            Breadcrumb::Storage => "storage",
            Breadcrumb::Net => "net",
            Breadcrumb::Cell => "cell",
        }
    }
}

/// Lock-free breadcrumb trail readable from any thread.
pub struct Breadcrumbs {
    crumb: AtomicU8,
    tick_no: AtomicU64,
}

impl Breadcrumbs {
    pub fn new() -> Self {
        Self {
            crumb: AtomicU8::new(Breadcrumb::Idle as u8),
            tick_no: AtomicU64::new(0),
        }
    }

    fn enter(&self, crumb: Breadcrumb) {
        self.crumb.store(crumb as u8, Ordering::Release);
    }

    fn next_tick(&self) {
        self.tick_no.fetch_add(1, Ordering::Release);
    }

    /// (last entered subsystem, tick counter).
    pub fn snapshot(&self) -> (Breadcrumb, u64) {
        (
            Breadcrumb::from_u8(self.crumb.load(Ordering::Acquire)),
            self.tick_no.load(Ordering::Acquire),
        )
    }
}

impl Default for Breadcrumbs {
    fn default() -> Self {
        Self::new()
    }
}

/// The periodic driver of all subsystems.
pub struct Scheduler {
    tick_interval: Duration,
    breadcrumbs: Arc<Breadcrumbs>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            breadcrumbs: Arc::new(Breadcrumbs::new()),
            shutdown,
        }
    }

    /// Override the tick period (tests run fast).
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn breadcrumbs(&self) -> Arc<Breadcrumbs> {
        self.breadcrumbs.clone()
    }

    /// Run one tick over every subsystem.
    pub fn tick(&self, gateway: &mut Gateway, now: Instant) {
        self.breadcrumbs.next_tick();

        self.breadcrumbs.enter(Breadcrumb::Storage);
        if let Err(e) = gateway.engine().maintain() {
            log::error!("[Scheduler] storage maintenance failed: {}", e);
        }

        self.breadcrumbs.enter(Breadcrumb::Net);
        gateway.net_mut().tick(now);

        self.breadcrumbs.enter(Breadcrumb::Cell);
        if let Some(cell) = gateway.cell_mut() {
            cell.tick(now);
        }

        self.breadcrumbs.enter(Breadcrumb::Idle);
    }

    /// Drive ticks until shutdown, then flush RAM chains to disk inside
    /// the configured grace period.
    pub fn run(&self, gateway: &mut Gateway) {
        log::info!(
            "[Scheduler] main loop started, tick {:?}",
            self.tick_interval
        );
        while !self.shutdown.load(Ordering::Acquire) {
            let started = Instant::now();
            self.tick(gateway, started);

            let spent = started.elapsed();
            if spent > self.tick_interval {
                let (crumb, tick_no) = self.breadcrumbs.snapshot();
                log::warn!(
                    "[Scheduler] tick {} overran: {:?} (last subsystem: {})",
                    tick_no,
                    spent,
                    crumb.name()
                );
            } else {
                std::thread::sleep(self.tick_interval - spent);
            }
            crate::diag_debug!(DBG_SCHED, "[Scheduler] tick complete in {:?}", spent);
        }

        self.flush_on_shutdown(gateway);
    }

    fn flush_on_shutdown(&self, gateway: &mut Gateway) {
        let grace = gateway.shutdown_grace();
        let deadline = Instant::now() + grace;
        log::info!("[Scheduler] shutdown: flushing RAM chains (grace {:?})", grace);

        match gateway.engine().flush_all() {
            Ok(sectors) => log::info!("[Scheduler] flushed {} sectors to disk", sectors),
            Err(e) => log::error!("[Scheduler] shutdown flush failed: {}", e),
        }
        if Instant::now() > deadline {
            log::warn!("[Scheduler] shutdown flush exceeded the grace period");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
