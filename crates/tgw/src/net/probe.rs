// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connectivity probes.
//!
//! A probe is N UDP round trips to the configured anchor host, run on its
//! own worker thread so the scheduler tick never blocks. Results come back
//! over a channel; the manager folds them into per-interface scores.
//!
//! The `Prober` trait exists so tests can script outcomes instead of
//! touching real sockets.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::diag::DBG_NET;
use crate::net::iface::IfaceKind;

/// One probe order.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub iface: IfaceKind,
    /// OS device to bind the probe socket to.
    pub os_name: String,
    pub anchor_host: String,
    pub anchor_port: u16,
    pub rounds: u32,
    pub round_timeout: Duration,
}

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub iface: IfaceKind,
    pub successes: u32,
    pub rounds: u32,
    pub local_ip: Option<IpAddr>,
}

impl ProbeOutcome {
    /// Score 0-10: `floor(successes / rounds * 10)`.
    pub fn score(&self) -> u8 {
        if self.rounds == 0 {
            return 0;
        }
        ((self.successes * 10) / self.rounds) as u8
    }
}

/// Launches probes; implementations must not block the caller.
pub trait Prober: Send {
    fn launch(&self, req: ProbeRequest, tx: Sender<ProbeOutcome>);
}

/// Production prober: UDP echo round trips on a worker thread.
pub struct UdpProber;

impl Prober for UdpProber {
    fn launch(&self, req: ProbeRequest, tx: Sender<ProbeOutcome>) {
        let iface = req.iface;
        let rounds = req.rounds;
        let fallback_tx = tx.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("tgw-probe-{}", iface))
            .spawn(move || {
                let outcome = run_probe(&req);
                crate::diag_debug!(
                    DBG_NET,
                    "[UdpProber] {} -> {}/{} ok",
                    req.iface,
                    outcome.successes,
                    outcome.rounds
                );
                let _ = tx.send(outcome);
            });

        if let Err(e) = spawned {
            log::error!("[UdpProber] worker spawn failed: {}", e);
            let _ = fallback_tx.send(ProbeOutcome {
                iface,
                successes: 0,
                rounds,
                local_ip: None,
            });
        }
    }
}

fn run_probe(req: &ProbeRequest) -> ProbeOutcome {
    let failed = ProbeOutcome {
        iface: req.iface,
        successes: 0,
        rounds: req.rounds,
        local_ip: None,
    };

    let anchor = format!("{}:{}", req.anchor_host, req.anchor_port);
    let Some(addr) = resolve(&anchor) else {
        return failed;
    };

    let socket = match probe_socket(req, addr) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[UdpProber] {}: socket setup failed: {}", req.iface, e);
            return failed;
        }
    };

    let local_ip = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .map(|a| a.ip());

    let mut successes = 0u32;
    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 64];
    for round in 0..req.rounds {
        let token = probe_token(round);
        if socket.send(&token).is_err() {
            continue;
        }
        match socket.recv(&mut buf) {
            Ok(n) if n >= token.len() => {
                // SAFETY: recv initialized the first n bytes.
                let got =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), token.len()) };
                if got == token {
                    successes += 1;
                }
            }
            Ok(_) | Err(_) => {}
        }
    }

    ProbeOutcome {
        iface: req.iface,
        successes,
        rounds: req.rounds,
        local_ip,
    }
}

fn resolve(anchor: &str) -> Option<SocketAddr> {
    match anchor.to_socket_addrs() {
        Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
        Err(e) => {
            log::warn!("[UdpProber] cannot resolve {}: {}", anchor, e);
            None
        }
    }
}

fn probe_socket(req: &ProbeRequest, addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_read_timeout(Some(req.round_timeout))?;

    // Pin the probe to the interface under test; routing must not be
    // allowed to answer over a different uplink.
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(req.os_name.as_bytes()))?;

    socket.connect(&addr.into())?;
    Ok(socket)
}

fn probe_token(round: u32) -> [u8; 8] {
    let mut token = [0u8; 8];
    token[0..4].copy_from_slice(b"TGWP");
    token[4..8].copy_from_slice(&round.to_le_bytes());
    token
}

/// Test prober: hands back scripted outcomes synchronously.
///
/// Each interface has a queue of `successes` values; once the queue drains
/// the last value repeats. Used by the scenario tests and by bench rigs
/// that exercise the manager without a network.
pub struct ScriptedProber {
    script: Mutex<HashMap<IfaceKind, VecDeque<u32>>>,
    last: Mutex<HashMap<IfaceKind, u32>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Queue the next `successes` result for `iface`.
    pub fn push(&self, iface: IfaceKind, successes: u32) {
        self.script.lock().entry(iface).or_default().push_back(successes);
        self.last.lock().insert(iface, successes);
    }

    fn next(&self, iface: IfaceKind) -> u32 {
        if let Some(v) = self.script.lock().get_mut(&iface).and_then(VecDeque::pop_front) {
            self.last.lock().insert(iface, v);
            return v;
        }
        self.last.lock().get(&iface).copied().unwrap_or(0)
    }
}

impl Default for ScriptedProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober for ScriptedProber {
    fn launch(&self, req: ProbeRequest, tx: Sender<ProbeOutcome>) {
        let successes = self.next(req.iface).min(req.rounds);
        let octet = 10 + req.iface.index();
        let _ = tx.send(ProbeOutcome {
            iface: req.iface,
            successes,
            rounds: req.rounds,
            local_ip: Some(IpAddr::from([octet, 0, 0, 1])),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
