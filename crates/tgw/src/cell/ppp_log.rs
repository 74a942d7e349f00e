// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PPP link state inferred from the daemon's log.
//!
//! pppd does not expose its internal state; the supervisor tails its log
//! and classifies the most recent session. The classification table is
//! data, not code: new daemon versions with different phrasing extend
//! [`RULES`] without touching the parser. Log reads are cached with a
//! 1-second freshness bound to keep the syscall rate down.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Inferred PPP link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppLinkState {
    /// Daemon not running (decided by the supervisor, not the log).
    Down,
    /// Daemon launched, nothing else seen yet.
    Starting,
    /// Chat script is dialing.
    ChatRunning,
    /// Serial connection up, LCP not started.
    ChatConnected,
    /// LCP ConfReq seen, no ConfAck yet.
    LcpNegotiation,
    /// LCP established, IPCP not started.
    LcpEstablished,
    /// IPCP negotiating.
    IpcpNegotiation,
    /// Link up with addresses assigned.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Failure signature in the log.
    Error,
}

impl PppLinkState {
    pub fn name(self) -> &'static str {
        match self {
            PppLinkState::Down => "Down",
            PppLinkState::Starting => "Starting",
            PppLinkState::ChatRunning => "ChatRunning",
            PppLinkState::ChatConnected => "ChatConnected",
            PppLinkState::LcpNegotiation => "LcpNegotiation",
            PppLinkState::LcpEstablished => "LcpEstablished",
            PppLinkState::IpcpNegotiation => "IpcpNegotiation",
            PppLinkState::Connected => "Connected",
            PppLinkState::Disconnecting => "Disconnecting",
            PppLinkState::Error => "Error",
        }
    }
}

/// Categorized failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppErrorKind {
    ChatFailed,
    ModemHangup,
    LcpTerminated,
    NoCarrier,
    AuthFailed,
}

impl PppErrorKind {
    pub fn as_error(self) -> crate::Error {
        match self {
            PppErrorKind::ChatFailed => crate::Error::ChatFailed,
            PppErrorKind::ModemHangup | PppErrorKind::NoCarrier => crate::Error::NoCarrier,
            PppErrorKind::LcpTerminated => crate::Error::LcpTimeout,
            PppErrorKind::AuthFailed => crate::Error::AuthFailed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PppErrorKind::ChatFailed => "chat script failed",
            PppErrorKind::ModemHangup => "modem hangup",
            PppErrorKind::LcpTerminated => "LCP terminated",
            PppErrorKind::NoCarrier => "no carrier",
            PppErrorKind::AuthFailed => "authentication failed",
        }
    }
}

/// Addresses negotiated by IPCP, scraped from the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PppEndpoints {
    pub local_ip: Option<IpAddr>,
    pub remote_ip: Option<IpAddr>,
    pub dns_primary: Option<IpAddr>,
    pub dns_secondary: Option<IpAddr>,
}

/// One classification rule: all `requires` substrings present, none of the
/// `absent` substrings present, within the current session's lines.
struct Rule {
    state: PppLinkState,
    requires: &'static [&'static str],
    absent: &'static [&'static str],
    error: Option<PppErrorKind>,
}

/// Classification table, checked top to bottom; first match wins.
///
/// Failure and teardown signatures outrank progress signatures because a
/// session can contain both (connect, then die).
static RULES: &[Rule] = &[
    Rule {
        state: PppLinkState::Error,
        requires: &["Connect script failed"],
        absent: &[],
        error: Some(PppErrorKind::ChatFailed),
    },
    Rule {
        state: PppLinkState::Error,
        requires: &["Modem hangup"],
        absent: &[],
        error: Some(PppErrorKind::ModemHangup),
    },
    Rule {
        state: PppLinkState::Error,
        requires: &["LCP terminated"],
        absent: &[],
        error: Some(PppErrorKind::LcpTerminated),
    },
    Rule {
        state: PppLinkState::Error,
        requires: &["NO CARRIER"],
        absent: &[],
        error: Some(PppErrorKind::NoCarrier),
    },
    Rule {
        state: PppLinkState::Error,
        requires: &["authentication failed"],
        absent: &[],
        error: Some(PppErrorKind::AuthFailed),
    },
    Rule {
        state: PppLinkState::Disconnecting,
        requires: &["Terminating"],
        absent: &[],
        error: None,
    },
    Rule {
        state: PppLinkState::Disconnecting,
        requires: &["ip-down started"],
        absent: &[],
        error: None,
    },
    Rule {
        state: PppLinkState::Connected,
        requires: &["local IP address", "ip-up finished"],
        absent: &[],
        error: None,
    },
    Rule {
        state: PppLinkState::IpcpNegotiation,
        requires: &["IPCP ConfReq"],
        absent: &["local IP address"],
        error: None,
    },
    Rule {
        state: PppLinkState::LcpEstablished,
        requires: &["LCP ConfAck"],
        absent: &["IPCP ConfReq"],
        error: None,
    },
    Rule {
        state: PppLinkState::LcpNegotiation,
        requires: &["LCP ConfReq"],
        absent: &["LCP ConfAck"],
        error: None,
    },
    Rule {
        state: PppLinkState::ChatConnected,
        requires: &["CONNECT", "Serial connection established"],
        absent: &["LCP ConfReq"],
        error: None,
    },
    Rule {
        state: PppLinkState::ChatRunning,
        requires: &["ATDT"],
        absent: &["CONNECT"],
        error: None,
    },
];

/// Markers that open a new daemon session; classification is scoped to the
/// lines after the most recent one.
static SESSION_MARKERS: &[&str] = &["Start Pppd", "starting pppd", "pppd 2."];

/// Classify the log tail. Returns the inferred state, the categorized
/// error when the state is `Error`, and any endpoints found.
pub fn classify(lines: &[String]) -> (PppLinkState, Option<PppErrorKind>, PppEndpoints) {
    let session = session_scope(lines);
    let endpoints = extract_endpoints(session);

    for rule in RULES {
        let hit = rule.requires.iter().all(|p| contains(session, p))
            && !rule.absent.iter().any(|p| contains(session, p));
        if hit {
            return (rule.state, rule.error, endpoints);
        }
    }
    // Daemon alive but no signature yet.
    (PppLinkState::Starting, None, endpoints)
}

/// Lines of the most recent session (after the last session marker).
fn session_scope(lines: &[String]) -> &[String] {
    // Most-recent-first search for a session boundary.
    for (i, line) in lines.iter().enumerate().rev() {
        if SESSION_MARKERS.iter().any(|m| line.contains(m)) {
            return &lines[i..];
        }
    }
    lines
}

fn contains(lines: &[String], pattern: &str) -> bool {
    lines.iter().any(|l| l.contains(pattern))
}

fn extract_endpoints(lines: &[String]) -> PppEndpoints {
    let mut ep = PppEndpoints::default();
    for line in lines {
        // Last occurrence wins; iterate forward overwriting.
        if let Some(ip) = trailing_ip(line, "local IP address") {
            ep.local_ip = Some(ip);
        } else if let Some(ip) = trailing_ip(line, "remote IP address") {
            ep.remote_ip = Some(ip);
        } else if let Some(ip) = trailing_ip(line, "primary DNS address") {
            ep.dns_primary = Some(ip);
        } else if let Some(ip) = trailing_ip(line, "secondary DNS address") {
            ep.dns_secondary = Some(ip);
        }
    }
    ep
}

fn trailing_ip(line: &str, marker: &str) -> Option<IpAddr> {
    let at = line.find(marker)?;
    line[at + marker.len()..].trim().parse().ok()
}

/// Source of PPP daemon log lines.
pub trait PppLogSource: Send {
    /// The last `max_lines` lines of the log.
    fn read_tail(&mut self, max_lines: usize) -> io::Result<Vec<String>>;
}

/// Production source: reads the tail of the daemon's log file.
pub struct FilePppLog {
    path: PathBuf,
}

impl FilePppLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

/// Bytes to back up from the end of the file when tailing.
const TAIL_WINDOW: u64 = 16 * 1024;

impl PppLogSource for FilePppLog {
    fn read_tail(&mut self, max_lines: usize) -> io::Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        if len > TAIL_WINDOW {
            reader.seek(SeekFrom::Start(len - TAIL_WINDOW))?;
            // Drop the (likely partial) first line of the window.
            let mut skip = String::new();
            reader.read_line(&mut skip)?;
        }

        let mut lines: Vec<String> = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }
        if lines.len() > max_lines {
            lines.drain(0..lines.len() - max_lines);
        }
        Ok(lines)
    }
}

/// Cache wrapper bounding the read rate of any log source.
pub struct CachedPppLog {
    source: Box<dyn PppLogSource>,
    freshness: Duration,
    cache: Vec<String>,
    fetched_at: Option<Instant>,
}

impl CachedPppLog {
    pub fn new(source: Box<dyn PppLogSource>, freshness: Duration) -> Self {
        Self {
            source,
            freshness,
            cache: Vec::new(),
            fetched_at: None,
        }
    }

    /// Current tail, re-read at most once per freshness interval.
    pub fn lines(&mut self, now: Instant, max_lines: usize) -> &[String] {
        let stale = self
            .fetched_at
            .map_or(true, |at| now.duration_since(at) >= self.freshness);
        if stale {
            match self.source.read_tail(max_lines) {
                Ok(lines) => self.cache = lines,
                Err(e) => log::warn!("[CachedPppLog] log read failed: {}", e),
            }
            self.fetched_at = Some(now);
        }
        &self.cache
    }

    /// Drop the cache so the next read hits the source (used right after
    /// starting or stopping the daemon).
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================
