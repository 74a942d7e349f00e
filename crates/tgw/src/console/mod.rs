// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operator console: command dispatch and snapshots.
//!
//! The console is a line protocol: one command in, formatted text out.
//! The TCP front-end lives in [`server`]; `tgwctl` is the matching client.
//!
//! | Command | Effect |
//! |---|---|
//! | `ms` | Pool summary: used/total sectors, free, efficiency. |
//! | `ms use` | Per-sensor chain length (computed by walking the chain). |
//! | `debug <hex-mask>` | Set diagnostic categories. |
//! | `net` | Current interface, per-interface scores, cooldowns. |
//! | `cell` | Supervisor state, carrier, signal, last PPP state. |
//! | `ppp status/logs [N]/health/start/stop/restart` | PPP control. |

pub mod server;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use crate::cell::supervisor::{CellCommand, CellShared};
use crate::diag;
use crate::net::manager::NetShared;
use crate::storage::StorageEngine;

/// Command dispatcher over the live components.
pub struct Console {
    engine: Arc<StorageEngine>,
    net: Arc<NetShared>,
    cell: Option<Arc<CellShared>>,
}

impl Console {
    pub fn new(
        engine: Arc<StorageEngine>,
        net: Arc<NetShared>,
        cell: Option<Arc<CellShared>>,
    ) -> Self {
        Self { engine, net, cell }
    }

    /// Execute one command line and return the reply text.
    pub fn dispatch(&self, line: &str) -> String {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("ms") => match words.next() {
                None => self.pool_summary(),
                Some("use") => self.chain_usage(),
                Some(other) => format!("unknown ms subcommand: {}\n", other),
            },
            Some("debug") => match words.next() {
                Some(mask) => self.set_debug(mask),
                None => format!("debug mask = 0x{:04x}\n", diag::debug_mask()),
            },
            Some("net") => self.net_summary(),
            Some("cell") => self.cell_summary(),
            Some("ppp") => self.ppp_command(words.next(), words.next()),
            Some("help") | None => HELP.to_string(),
            Some(other) => format!("unknown command: {} (try help)\n", other),
        }
    }

    fn pool_summary(&self) -> String {
        let pool = self.engine.pool();
        let total = pool.total_sectors();
        let free = pool.free_sectors();
        let used = total - free;
        format!(
            "sectors: {}/{} used ({}%), {} free\nefficiency: {}%\n",
            used,
            total,
            pool.usage_percent(),
            free,
            self.engine.storage_efficiency_pct()
        )
    }

    fn chain_usage(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:>6}  {:<20} {:>8} {:>10} {:>8}", "id", "name", "sectors", "records", "dropped");
        for id in self.engine.sensor_ids() {
            let name = self.engine.sensor_name(id).unwrap_or("?").to_string();
            let sectors = match self.engine.sector_count(id) {
                Ok(n) => n.to_string(),
                Err(_) => "CORRUPT".to_string(),
            };
            let records = self.engine.total_records(id).unwrap_or(0);
            let dropped = self.engine.dropped(id).unwrap_or(0);
            let degraded = self.engine.is_degraded(id).unwrap_or(false);
            let _ = writeln!(
                out,
                "{:>6}  {:<20} {:>8} {:>10} {:>8}{}",
                id,
                name,
                sectors,
                records,
                dropped,
                if degraded { "  DEGRADED" } else { "" }
            );
        }
        out
    }

    fn set_debug(&self, mask: &str) -> String {
        let raw = mask.trim_start_matches("0x");
        match u32::from_str_radix(raw, 16) {
            Ok(mask) => {
                diag::set_debug_mask(mask);
                format!("debug mask = 0x{:04x}\n", mask)
            }
            Err(_) => format!("invalid hex mask: {}\n", mask),
        }
    }

    fn net_summary(&self) -> String {
        let now = Instant::now();
        let mut out = String::new();
        let current = self.net.current_interface();
        let _ = writeln!(
            out,
            "state: {}   active: {}",
            self.net.state_name(),
            current.map_or("none".to_string(), |s| s.iface.to_string())
        );
        if let Some(until) = self.net.switch_blocked_until() {
            let left = until.saturating_duration_since(now);
            let _ = writeln!(out, "switch cooldown: {}s remaining", left.as_secs());
        }
        let _ = writeln!(
            out,
            "{:<10} {:>4} {:>6} {:>7} {:>9} {:>9}",
            "iface", "prio", "dhcp", "score", "active", "cooldown"
        );
        for entry in self.net.entries() {
            let status = entry.status.lock();
            let cooldown = status
                .cooldown_until
                .and_then(|until| {
                    let left = until.saturating_duration_since(now);
                    (left.as_secs() > 0).then(|| format!("{}s", left.as_secs()))
                })
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<10} {:>4} {:>6} {:>7} {:>9} {:>9}",
                entry.cfg.kind.to_string(),
                entry.cfg.priority,
                if entry.cfg.dhcp_server { "yes" } else { "no" },
                status.score.map_or("-".to_string(), |s| s.to_string()),
                if status.active { "yes" } else { "no" },
                cooldown
            );
        }
        out
    }

    fn cell_summary(&self) -> String {
        let Some(cell) = &self.cell else {
            return "cellular not configured\n".to_string();
        };
        let s = cell.status();
        let mut out = String::new();
        let _ = writeln!(out, "state: {}   ppp: {}", s.state, s.ppp_state);
        let _ = writeln!(
            out,
            "carrier: {}   signal: {}",
            s.carrier.as_deref().unwrap_or("-"),
            s.signal_csq.map_or("-".to_string(), |c| format!("{}/31", c))
        );
        let _ = writeln!(
            out,
            "local: {}   remote: {}",
            opt_ip(s.local_ip),
            opt_ip(s.remote_ip)
        );
        let _ = writeln!(
            out,
            "dns: {} / {}",
            opt_ip(s.dns_primary),
            opt_ip(s.dns_secondary)
        );
        if let Some(err) = &s.last_error {
            let _ = writeln!(out, "last error: {}", err);
        }
        if !s.blacklisted.is_empty() {
            let _ = writeln!(out, "blacklisted: {}", s.blacklisted.join(", "));
        }
        out
    }

    fn ppp_command(&self, sub: Option<&str>, arg: Option<&str>) -> String {
        let Some(cell) = &self.cell else {
            return "cellular not configured\n".to_string();
        };
        match sub {
            Some("status") => {
                let s = cell.status();
                format!(
                    "ppp: {}   supervisor: {}   online: {}s\nlocal: {}   remote: {}\n",
                    s.ppp_state,
                    s.state,
                    s.online_secs,
                    opt_ip(s.local_ip),
                    opt_ip(s.remote_ip)
                )
            }
            Some("logs") => {
                let n = arg.and_then(|a| a.parse::<usize>().ok()).unwrap_or(20);
                let s = cell.status();
                let start = s.recent_log.len().saturating_sub(n);
                let mut out = String::new();
                for line in &s.recent_log[start..] {
                    let _ = writeln!(out, "{}", line);
                }
                if out.is_empty() {
                    out.push_str("(no log lines)\n");
                }
                out
            }
            Some("health") => {
                let s = cell.status();
                format!(
                    "health passes: {}   consecutive failures: {}   online: {}s\n",
                    s.health_passes, s.consecutive_failures, s.online_secs
                )
            }
            Some("start") => {
                cell.request(CellCommand::PppStart);
                "ppp start requested\n".to_string()
            }
            Some("stop") => {
                cell.request(CellCommand::PppStop);
                "ppp stop requested\n".to_string()
            }
            Some("restart") => {
                cell.request(CellCommand::PppRestart);
                "ppp restart requested\n".to_string()
            }
            Some("scan") => {
                cell.request_manual_scan();
                "manual carrier scan requested\n".to_string()
            }
            _ => "usage: ppp status|logs [N]|health|start|stop|restart|scan\n".to_string(),
        }
    }
}

fn opt_ip(ip: Option<std::net::IpAddr>) -> String {
    ip.map_or_else(|| "-".to_string(), |ip| ip.to_string())
}

const HELP: &str = "commands:
  ms              pool summary
  ms use          per-sensor chain usage
  debug <hex>     set diagnostic category mask
  net             interface manager status
  cell            cellular supervisor status
  ppp <cmd>       ppp status|logs [N]|health|start|stop|restart|scan
";

// ============================================================================
// TESTS
// ============================================================================
