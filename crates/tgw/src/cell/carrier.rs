// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Carrier scan parsing, scoring, and blacklisting.

use std::collections::HashMap;

/// One carrier candidate from an `AT+COPS=?` scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Carrier {
    /// Long alphanumeric name ("Vodafone DE").
    pub name: String,
    /// Numeric PLMN ("26202"); the stable identity used for selection and
    /// blacklisting.
    pub numeric: String,
    /// Signal quality (CSQ 0-31) measured while camped on the carrier.
    pub signal: Option<u8>,
}

/// Parse the operator list out of an `AT+COPS=?` reply.
///
/// Format: `+COPS: (2,"Vodafone DE","voda","26202",7),(1,"o2 - de",...)`,
/// with a status digit per entry (0 unknown, 1 available, 2 current,
/// 3 forbidden). Forbidden entries are dropped.
pub fn parse_cops_scan(reply: &str) -> Vec<Carrier> {
    let mut out = Vec::new();
    let Some(line) = reply.lines().find(|l| l.trim_start().starts_with("+COPS:")) else {
        return out;
    };

    let mut rest = line.trim_start().trim_start_matches("+COPS:").trim();
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        let entry = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let fields = split_quoted(entry);
        if fields.len() < 4 {
            continue;
        }
        let status = fields[0].trim().parse::<u8>().unwrap_or(0);
        if status == 3 {
            continue; // forbidden
        }
        let name = fields[1].trim_matches('"').to_string();
        let numeric = fields[3].trim_matches('"').to_string();
        if numeric.is_empty() {
            continue;
        }
        out.push(Carrier {
            name,
            numeric,
            signal: None,
        });
    }
    out
}

/// Parse `+CSQ: <rssi>,<ber>`; 99 means "not known".
pub fn parse_csq(reply: &str) -> Option<u8> {
    let line = reply.lines().find(|l| l.trim_start().starts_with("+CSQ:"))?;
    let value = line
        .trim_start()
        .trim_start_matches("+CSQ:")
        .split(',')
        .next()?
        .trim()
        .parse::<u8>()
        .ok()?;
    if value > 31 {
        return None;
    }
    Some(value)
}

/// Parse `+CREG: <n>,<stat>`; registered means stat 1 (home) or 5 (roam).
pub fn parse_creg_registered(reply: &str) -> Option<bool> {
    let line = reply.lines().find(|l| l.trim_start().starts_with("+CREG:"))?;
    let stat = line
        .trim_start()
        .trim_start_matches("+CREG:")
        .split(',')
        .nth(1)?
        .trim()
        .parse::<u8>()
        .ok()?;
    Some(stat == 1 || stat == 5)
}

/// Parse the current operator out of `AT+COPS?`.
pub fn parse_cops_current(reply: &str) -> Option<String> {
    let line = reply.lines().find(|l| l.trim_start().starts_with("+COPS:"))?;
    let fields = split_quoted(line.trim_start().trim_start_matches("+COPS:"));
    let name = fields.get(2)?.trim_matches('"').trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Split a comma-separated field list, keeping quoted commas intact.
fn split_quoted(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_quote = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => depth_quote = !depth_quote,
            ',' if !depth_quote => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(s[start..].trim());
    out
}

/// Consecutive-failure tracking per carrier.
///
/// A carrier is blacklisted after `threshold` consecutive PPP activation
/// failures; any successful connection clears the whole board. Manual
/// (operator-initiated) scans never feed this.
pub struct Blacklist {
    threshold: u32,
    counts: HashMap<String, u32>,
    listed: Vec<String>,
}

impl Blacklist {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
            listed: Vec::new(),
        }
    }

    /// Record a PPP activation failure. Returns true when this failure
    /// tipped the carrier onto the blacklist.
    pub fn record_failure(&mut self, numeric: &str) -> bool {
        let count = self.counts.entry(numeric.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !self.listed.iter().any(|c| c == numeric) {
            log::warn!(
                "[Blacklist] carrier {} blacklisted after {} consecutive failures",
                numeric,
                count
            );
            self.listed.push(numeric.to_string());
            return true;
        }
        false
    }

    /// A successful connection clears every count and listing.
    pub fn clear(&mut self) {
        if !self.listed.is_empty() {
            log::info!("[Blacklist] cleared after successful connection");
        }
        self.counts.clear();
        self.listed.clear();
    }

    pub fn is_listed(&self, numeric: &str) -> bool {
        self.listed.iter().any(|c| c == numeric)
    }

    /// Blacklisted carriers, for the console.
    pub fn listed(&self) -> &[String] {
        &self.listed
    }
}

// ============================================================================
// TESTS
// ============================================================================
