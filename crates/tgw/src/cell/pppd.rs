// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PPP daemon lifecycle control.
//!
//! The daemon is started through a shell entry point
//! (`/etc/start_pppd.sh`), never via `pon`: the peers files `pon` depends
//! on are not guaranteed to exist on field units. Liveness and signalling
//! go through the daemon's pid file.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::config::CellConfig;

/// Control surface over the PPP daemon, mockable for tests.
pub trait PppController: Send {
    /// Launch the daemon via the configured entry point.
    fn start(&mut self) -> io::Result<()>;

    /// Is a daemon currently alive?
    fn is_running(&mut self) -> bool;

    /// Polite stop (SIGTERM).
    fn signal_stop(&mut self);

    /// Forced stop (SIGKILL).
    fn force_kill(&mut self);

    /// Remove stale lock and pid files after a forced stop.
    fn clean_locks(&mut self);

    /// Local address of the PPP network interface, if the link is up.
    fn link_local_ip(&mut self) -> Option<IpAddr>;
}

/// Production controller shelling out to the start script and signalling
/// through the pid file.
pub struct ShellPppController {
    start_script: String,
    pidfile: PathBuf,
    lock_files: Vec<PathBuf>,
    ppp_ifname: String,
    child: Option<Child>,
}

impl ShellPppController {
    pub fn new(cfg: &CellConfig) -> Self {
        Self {
            start_script: cfg.ppp_start_script.clone(),
            pidfile: cfg.ppp_pidfile.clone(),
            lock_files: cfg.lock_files.clone(),
            ppp_ifname: "ppp0".to_string(),
            child: None,
        }
    }

    fn daemon_pid(&self) -> Option<i32> {
        let raw = std::fs::read_to_string(&self.pidfile).ok()?;
        raw.lines().next()?.trim().parse().ok()
    }

    fn reap_launcher(&mut self) {
        if let Some(child) = &mut self.child {
            if let Ok(Some(_)) = child.try_wait() {
                self.child = None;
            }
        }
    }
}

impl PppController for ShellPppController {
    fn start(&mut self) -> io::Result<()> {
        log::info!("[ShellPppController] starting pppd via {}", self.start_script);
        let child = Command::new("/bin/sh")
            .arg(&self.start_script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.reap_launcher();
        let Some(pid) = self.daemon_pid() else {
            return false;
        };
        // Signal 0 probes liveness without delivering anything.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn signal_stop(&mut self) {
        if let Some(pid) = self.daemon_pid() {
            log::info!("[ShellPppController] SIGTERM to pppd pid {}", pid);
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    fn force_kill(&mut self) {
        if let Some(pid) = self.daemon_pid() {
            log::warn!("[ShellPppController] SIGKILL to pppd pid {}", pid);
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    fn clean_locks(&mut self) {
        for path in self.lock_files.iter().chain(std::iter::once(&self.pidfile)) {
            match std::fs::remove_file(path) {
                Ok(()) => log::info!("[ShellPppController] removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "[ShellPppController] cannot remove {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }

    fn link_local_ip(&mut self) -> Option<IpAddr> {
        let ifas = local_ip_address::list_afinet_netifas().ok()?;
        ifas.into_iter()
            .find(|(name, ip)| name == &self.ppp_ifname && ip.is_ipv4())
            .map(|(_, ip)| ip)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_locks_tolerates_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = CellConfig::default();
        cfg.ppp_pidfile = dir.path().join("ppp0.pid");
        cfg.lock_files = vec![dir.path().join("LCK..ttyUSB2")];

        std::fs::write(&cfg.lock_files[0], "").expect("touch lock");
        let mut ctrl = ShellPppController::new(&cfg);
        ctrl.clean_locks();
        assert!(!cfg.lock_files[0].exists());

        // Second pass: nothing to remove, no panic.
        ctrl.clean_locks();
    }

    #[test]
    fn test_no_pidfile_means_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = CellConfig::default();
        cfg.ppp_pidfile = dir.path().join("ppp0.pid");
        let mut ctrl = ShellPppController::new(&cfg);
        assert!(!ctrl.is_running());
    }
}
