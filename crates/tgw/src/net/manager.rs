// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Uplink interface selection state machine.
//!
//! ```text
//! Init -> Select -> WaitResults -> Review -> Online
//!                       ^                      |
//!                       |          CheckResults/VerifyResults
//!                       +----------- (health fail / rescan)
//! ```
//!
//! One tick advances at most one state. Probes run on workers; the machine
//! only drains their channel. Selection prefers the highest-priority
//! interface scoring `good_available` or better, falls back to anything at
//! `min_acceptable`, and is damped by switch hysteresis: too many switches
//! inside the window freeze the current selection for a cooldown while
//! probing and reporting continue.
//!
//! DHCP-server interfaces are invisible to every phase: no probes, never
//! active, never cooled down. The cellular candidate is gated on the
//! supervisor's readiness flag; a rising edge forces an immediate rescan
//! instead of waiting out the rescan interval.

use arc_swap::ArcSwapOption;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::NetConfig;
use crate::diag::{DiagEvent, Hub, DBG_NET};
use crate::net::iface::{IfaceEntry, IfaceKind};
use crate::net::probe::{ProbeOutcome, ProbeRequest, Prober};

/// Manager states; the variable itself is owned by the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    Init,
    Select,
    WaitResults,
    Review,
    Online,
    CheckResults,
    VerifyResults,
}

impl NetState {
    pub fn name(self) -> &'static str {
        match self {
            NetState::Init => "Init",
            NetState::Select => "Select",
            NetState::WaitResults => "WaitResults",
            NetState::Review => "Review",
            NetState::Online => "Online",
            NetState::CheckResults => "CheckResults",
            NetState::VerifyResults => "VerifyResults",
        }
    }
}

/// The published uplink selection read by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub iface: IfaceKind,
    pub local_ip: Option<IpAddr>,
}

/// State shared with the console and the transport.
pub struct NetShared {
    entries: Vec<IfaceEntry>,
    current: ArcSwapOption<Selection>,
    state_name: Mutex<&'static str>,
    rescan_manual: AtomicBool,
    rescan_auto: AtomicBool,
    switch_block_until: Mutex<Option<Instant>>,
}

impl NetShared {
    /// Currently selected uplink, if any.
    pub fn current_interface(&self) -> Option<Selection> {
        self.current.load().as_deref().copied()
    }

    /// Request a rescan on the next tick. Manual requests also clear the
    /// selection backoff.
    pub fn request_rescan(&self, manual: bool) {
        if manual {
            self.rescan_manual.store(true, Ordering::Release);
        } else {
            self.rescan_auto.store(true, Ordering::Release);
        }
    }

    /// Manager state name (console reporting).
    pub fn state_name(&self) -> &'static str {
        *self.state_name.lock()
    }

    /// Hysteresis freeze deadline, if switching is currently blocked.
    pub fn switch_blocked_until(&self) -> Option<Instant> {
        *self.switch_block_until.lock()
    }

    /// Per-interface entries (console reporting).
    pub fn entries(&self) -> &[IfaceEntry] {
        &self.entries
    }
}

type ChangeCallback = Box<dyn Fn(IfaceKind, Option<IpAddr>) + Send>;

/// The uplink selection state machine.
pub struct NetManager {
    cfg: NetConfig,
    shared: Arc<NetShared>,
    state: NetState,
    prober: Box<dyn Prober>,
    tx: Sender<ProbeOutcome>,
    rx: Receiver<ProbeOutcome>,
    callbacks: Vec<ChangeCallback>,
    /// Recent switch instants inside the hysteresis window.
    switch_times: VecDeque<Instant>,
    /// Probes still outstanding in the current wave.
    awaiting: usize,
    wait_deadline: Option<Instant>,
    /// Earliest instant the next selection wave may start (backoff after a
    /// wave found nothing usable).
    select_not_before: Option<Instant>,
    last_health: Option<Instant>,
    last_rescan: Option<Instant>,
    cell_ready: Arc<AtomicBool>,
    cell_ready_last: bool,
    hub: Arc<Hub>,
}

impl NetManager {
    pub fn new(
        cfg: NetConfig,
        prober: Box<dyn Prober>,
        cell_ready: Arc<AtomicBool>,
        hub: Arc<Hub>,
    ) -> Self {
        let entries = cfg
            .interfaces
            .iter()
            .map(|ic| IfaceEntry::new(ic.clone()))
            .collect();
        let (tx, rx) = unbounded();
        Self {
            cfg,
            shared: Arc::new(NetShared {
                entries,
                current: ArcSwapOption::empty(),
                state_name: Mutex::new(NetState::Init.name()),
                rescan_manual: AtomicBool::new(false),
                rescan_auto: AtomicBool::new(false),
                switch_block_until: Mutex::new(None),
            }),
            state: NetState::Init,
            prober,
            tx,
            rx,
            callbacks: Vec::new(),
            switch_times: VecDeque::new(),
            awaiting: 0,
            wait_deadline: None,
            select_not_before: None,
            last_health: None,
            last_rescan: None,
            cell_ready,
            cell_ready_last: false,
            hub,
        }
    }

    /// Handle the console and the transport read state through.
    pub fn shared(&self) -> Arc<NetShared> {
        self.shared.clone()
    }

    /// Register the interface-change callback (socket rebind hook).
    /// Delivered on the scheduler thread, before any subsequent upload.
    pub fn on_interface_changed(&mut self, cb: impl Fn(IfaceKind, Option<IpAddr>) + Send + 'static) {
        self.callbacks.push(Box::new(cb));
    }

    /// Currently selected uplink.
    pub fn current_interface(&self) -> Option<IfaceKind> {
        self.shared.current_interface().map(|s| s.iface)
    }

    pub fn state(&self) -> NetState {
        self.state
    }

    /// One scheduler tick.
    pub fn tick(&mut self, now: Instant) {
        // Rising edge of cellular readiness: re-probe immediately instead
        // of waiting for the next periodic rescan.
        let ready = self.cell_ready.load(Ordering::Acquire);
        if ready && !self.cell_ready_last {
            log::info!("[NetManager] cellular became ready, forcing rescan");
            self.shared.rescan_auto.store(true, Ordering::Release);
            self.select_not_before = None;
        }
        self.cell_ready_last = ready;

        // A manual rescan bypasses the selection backoff.
        if self.shared.rescan_manual.load(Ordering::Acquire) {
            self.select_not_before = None;
        }

        // Expired hysteresis freeze resets the switch counter.
        {
            let mut blocked = self.shared.switch_block_until.lock();
            if let Some(until) = *blocked {
                if now >= until {
                    *blocked = None;
                    self.switch_times.clear();
                    log::info!("[NetManager] switch cooldown expired");
                }
            }
        }

        match self.state {
            NetState::Init => self.enter(NetState::Select),
            NetState::Select => self.tick_select(now),
            NetState::WaitResults => self.tick_wait_results(now),
            NetState::Review => self.tick_review(now),
            NetState::Online => self.tick_online(now),
            NetState::CheckResults => self.tick_check_results(now),
            NetState::VerifyResults => self.tick_verify_results(now),
        }
    }

    fn enter(&mut self, next: NetState) {
        if next != self.state {
            self.hub.publish(&DiagEvent::NetStateChanged {
                from: self.state.name(),
                to: next.name(),
            });
            crate::diag_debug!(
                DBG_NET,
                "[NetManager] {} -> {}",
                self.state.name(),
                next.name()
            );
            self.state = next;
            *self.shared.state_name.lock() = next.name();
        }
    }

    // ------------------------------------------------------------------
    // States
    // ------------------------------------------------------------------

    fn tick_select(&mut self, now: Instant) {
        if let Some(not_before) = self.select_not_before {
            if now < not_before {
                return;
            }
        }
        self.select_not_before = None;
        self.shared.rescan_manual.store(false, Ordering::Release);
        self.shared.rescan_auto.store(false, Ordering::Release);

        self.awaiting = 0;
        for entry in self.shared.entries.iter() {
            if !self.probe_eligible(entry, now) {
                continue;
            }
            entry.status.lock().probing = true;
            self.prober.launch(self.request_for(entry), self.tx.clone());
            self.awaiting += 1;
        }

        if self.awaiting == 0 {
            // Nothing to probe right now (all gated or cooling); back off.
            self.select_not_before = Some(now + self.cfg.health_interval);
            return;
        }
        self.wait_deadline = Some(now + self.cfg.probe_deadline);
        self.enter(NetState::WaitResults);
    }

    fn tick_wait_results(&mut self, now: Instant) {
        self.drain_outcomes();
        let timed_out = self.wait_deadline.map_or(false, |d| now >= d);
        if self.awaiting == 0 || timed_out {
            if timed_out && self.awaiting > 0 {
                log::warn!(
                    "[NetManager] probe wave timed out with {} results outstanding",
                    self.awaiting
                );
                self.awaiting = 0;
            }
            self.enter(NetState::Review);
        }
    }

    fn tick_review(&mut self, now: Instant) {
        match self.pick(now) {
            Some(selection) => {
                self.apply_selection(selection, now);
                self.last_health = Some(now);
                self.last_rescan = Some(now);
                self.enter(NetState::Online);
            }
            None => {
                log::warn!("[NetManager] no usable uplink, retrying after backoff");
                self.select_not_before = Some(now + self.cfg.health_interval);
                self.enter(NetState::Select);
            }
        }
    }

    fn tick_online(&mut self, now: Instant) {
        let rescan_requested = self.shared.rescan_manual.load(Ordering::Acquire)
            || self.shared.rescan_auto.load(Ordering::Acquire);
        let rescan_due = self
            .last_rescan
            .map_or(true, |at| now.duration_since(at) >= self.cfg.rescan_interval);
        if rescan_requested || rescan_due {
            self.enter(NetState::Select);
            return;
        }

        let health_due = self
            .last_health
            .map_or(true, |at| now.duration_since(at) >= self.cfg.health_interval);
        if health_due {
            let Some(selection) = self.shared.current_interface() else {
                self.enter(NetState::Select);
                return;
            };
            let Some(entry) = self.entry(selection.iface) else {
                self.enter(NetState::Select);
                return;
            };
            entry.status.lock().probing = true;
            self.prober.launch(self.request_for(entry), self.tx.clone());
            self.awaiting = 1;
            self.wait_deadline = Some(now + self.cfg.probe_deadline);
            self.last_health = Some(now);
            self.enter(NetState::CheckResults);
        }
    }

    fn tick_check_results(&mut self, now: Instant) {
        self.drain_outcomes();
        let timed_out = self.wait_deadline.map_or(false, |d| now >= d);
        if self.awaiting == 0 || timed_out {
            self.awaiting = 0;
            self.enter(NetState::VerifyResults);
        }
    }

    fn tick_verify_results(&mut self, now: Instant) {
        let Some(selection) = self.shared.current_interface() else {
            self.enter(NetState::Select);
            return;
        };
        let healthy = self.entry(selection.iface).map_or(false, |entry| {
            entry
                .status
                .lock()
                .score
                .map_or(false, |s| s >= self.cfg.min_acceptable)
        });

        if healthy {
            self.enter(NetState::Online);
        } else {
            log::warn!(
                "[NetManager] active interface {} failed its health probe",
                selection.iface
            );
            if let Some(entry) = self.entry(selection.iface) {
                let mut status = entry.status.lock();
                status.active = false;
                status.cooldown_until = Some(now + self.cfg.iface_cooldown);
            }
            self.enter(NetState::Select);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn entry(&self, kind: IfaceKind) -> Option<&IfaceEntry> {
        self.shared.entries.iter().find(|e| e.cfg.kind == kind)
    }

    fn request_for(&self, entry: &IfaceEntry) -> ProbeRequest {
        ProbeRequest {
            iface: entry.cfg.kind,
            os_name: entry.cfg.os_name.clone(),
            anchor_host: self.cfg.anchor_host.clone(),
            anchor_port: self.cfg.anchor_port,
            rounds: self.cfg.probe_rounds,
            round_timeout: self.cfg.probe_round_timeout,
        }
    }

    /// Probes never land on DHCP-server interfaces, interfaces in cooldown,
    /// or a cellular candidate the supervisor has not raised yet.
    fn probe_eligible(&self, entry: &IfaceEntry, now: Instant) -> bool {
        if entry.cfg.dhcp_server {
            return false;
        }
        if !entry.cooled_down(now) {
            return false;
        }
        if entry.cfg.kind == IfaceKind::Cellular && !self.cell_ready.load(Ordering::Acquire) {
            return false;
        }
        true
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.rx.try_recv() {
            let Some(entry) = self.entry(outcome.iface) else {
                continue;
            };
            let score = outcome.score();
            {
                let mut status = entry.status.lock();
                status.score = Some(score);
                status.last_probe = Some(Instant::now());
                status.probing = false;
                if outcome.local_ip.is_some() {
                    status.local_ip = outcome.local_ip;
                }
            }
            self.hub.publish(&DiagEvent::IfaceScore {
                iface: outcome.iface.index(),
                score,
            });
            self.awaiting = self.awaiting.saturating_sub(1);
        }
    }

    /// Selection rule over the freshly probed candidates.
    fn pick(&self, now: Instant) -> Option<Selection> {
        let mut candidates: Vec<(&IfaceEntry, u8)> = Vec::new();
        for entry in self.shared.entries.iter() {
            if !self.probe_eligible(entry, now) {
                continue;
            }
            let status = entry.status.lock();
            if let Some(score) = status.score {
                candidates.push((entry, score));
            }
        }
        // Priority order decides ties; lower priority value wins.
        candidates.sort_by_key(|(entry, _)| entry.cfg.priority);

        let chosen = candidates
            .iter()
            .find(|(_, score)| *score >= self.cfg.good_available)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|(_, score)| *score >= self.cfg.min_acceptable)
            })?;

        let (entry, _) = chosen;
        let local_ip = entry.status.lock().local_ip;
        Some(Selection {
            iface: entry.cfg.kind,
            local_ip,
        })
    }

    /// Commit a selection, honoring switch hysteresis.
    fn apply_selection(&mut self, selection: Selection, now: Instant) {
        let previous = self.shared.current_interface();
        if previous.map(|s| s.iface) == Some(selection.iface) {
            // Same interface; refresh the published address if it moved.
            if previous != Some(selection) {
                self.shared.current.store(Some(Arc::new(selection)));
            }
            return;
        }

        // Hysteresis: a switch burst freezes the current selection.
        if self.shared.switch_block_until.lock().is_some() {
            self.hub.publish(&DiagEvent::SwitchSuppressed {
                held_iface: previous.map_or(u8::MAX, |s| s.iface.index()),
            });
            return;
        }
        let window_start = now.checked_sub(self.cfg.switch_window).unwrap_or(now);
        while let Some(front) = self.switch_times.front() {
            if *front < window_start {
                self.switch_times.pop_front();
            } else {
                break;
            }
        }
        if self.switch_times.len() >= self.cfg.switch_window_max {
            *self.shared.switch_block_until.lock() = Some(now + self.cfg.switch_cooldown);
            log::warn!(
                "[NetManager] {} switches inside the window, freezing selection for {:?}",
                self.switch_times.len(),
                self.cfg.switch_cooldown
            );
            self.hub.publish(&DiagEvent::SwitchSuppressed {
                held_iface: previous.map_or(u8::MAX, |s| s.iface.index()),
            });
            return;
        }
        self.switch_times.push_back(now);

        // Flip active flags and publish.
        for entry in self.shared.entries.iter() {
            let mut status = entry.status.lock();
            status.active = entry.cfg.kind == selection.iface;
        }
        self.shared.current.store(Some(Arc::new(selection)));
        self.hub.publish(&DiagEvent::IfaceSelected {
            iface: selection.iface.index(),
        });
        log::info!(
            "[NetManager] uplink is now {} ({})",
            selection.iface,
            selection
                .local_ip
                .map_or_else(|| "no address".to_string(), |ip| ip.to_string())
        );
        for cb in &self.callbacks {
            cb(selection.iface, selection.local_ip);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
