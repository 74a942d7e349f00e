// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Component wiring.
//!
//! `Gateway::build` assembles the production stack (pool, engine, spool
//! recovery, UDP prober, serial modem, shell PPP controller, console
//! server). `Gateway::build_with` takes the same configuration plus
//! injected prober/modem/controller/log implementations, which is how the
//! scenario tests run the whole core without hardware.

use std::sync::Arc;

use crate::cell::at::ModemPort;
use crate::cell::ppp_log::{FilePppLog, PppLogSource};
use crate::cell::pppd::{PppController, ShellPppController};
use crate::cell::supervisor::CellSupervisor;
use crate::config::GatewayConfig;
use crate::console::server::ConsoleServer;
use crate::console::Console;
use crate::diag::Hub;
use crate::error::{Error, Result};
use crate::net::iface::IfaceKind;
use crate::net::manager::NetManager;
use crate::net::probe::{Prober, UdpProber};
use crate::storage::pool::SectorPool;
use crate::storage::StorageEngine;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// The assembled core.
pub struct Gateway {
    cfg: GatewayConfig,
    hub: Arc<Hub>,
    engine: Arc<StorageEngine>,
    net: NetManager,
    cell: Option<CellSupervisor>,
    console: Option<ConsoleServer>,
}

impl Gateway {
    /// Production wiring. Fails fast on invalid configuration; runs disk
    /// spillover recovery before returning.
    pub fn build(cfg: GatewayConfig) -> Result<Self> {
        let cellular = cfg
            .net
            .interfaces
            .iter()
            .any(|i| i.kind == IfaceKind::Cellular);

        let (port, ctrl, log): (
            Option<Box<dyn ModemPort>>,
            Option<Box<dyn PppController>>,
            Option<Box<dyn PppLogSource>>,
        ) = if cellular {
            #[cfg(not(unix))]
            return Err(Error::ConfigInvalid(
                "cellular supervision needs a Unix serial port".into(),
            ));
            #[cfg(unix)]
            {
                let serial =
                    crate::cell::serial::SerialPort::open(&cfg.cell.modem_device, cfg.cell.baud)
                        .map_err(|e| {
                            Error::ConfigInvalid(format!(
                                "cannot open modem device {}: {}",
                                cfg.cell.modem_device, e
                            ))
                        })?;
                (
                    Some(Box::new(serial) as Box<dyn ModemPort>),
                    Some(Box::new(ShellPppController::new(&cfg.cell)) as Box<dyn PppController>),
                    Some(Box::new(FilePppLog::new(cfg.cell.ppp_log_path.clone()))
                        as Box<dyn PppLogSource>),
                )
            }
        } else {
            (None, None, None)
        };

        Self::build_with(cfg, Box::new(UdpProber), port, ctrl, log)
    }

    /// Wiring with injected device implementations (tests, bench rigs).
    ///
    /// `port`/`ctrl`/`log` must be all-Some (cellular supervised) or
    /// all-None (no cellular interface).
    pub fn build_with(
        cfg: GatewayConfig,
        prober: Box<dyn Prober>,
        port: Option<Box<dyn ModemPort>>,
        ctrl: Option<Box<dyn PppController>>,
        log: Option<Box<dyn PppLogSource>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let hub = Arc::new(Hub::new());
        let pool = Arc::new(SectorPool::new(cfg.storage.pool_sectors, hub.clone())?);
        let engine = Arc::new(StorageEngine::new(&cfg, pool, hub.clone())?);
        engine.recover()?;

        let cell = match (port, ctrl, log) {
            (Some(port), Some(ctrl), Some(log)) => Some(CellSupervisor::new(
                cfg.cell.clone(),
                port,
                ctrl,
                log,
                hub.clone(),
            )),
            (None, None, None) => None,
            _ => {
                return Err(Error::ConfigInvalid(
                    "cellular devices must be injected together".into(),
                ))
            }
        };

        let ready = cell
            .as_ref()
            .map_or_else(|| Arc::new(AtomicBool::new(false)), |c| c.shared().ready_flag());
        let net = NetManager::new(cfg.net.clone(), prober, ready, hub.clone());

        let console = if cfg.console_port != 0 {
            let console = Arc::new(Console::new(
                engine.clone(),
                net.shared(),
                cell.as_ref().map(|c| c.shared()),
            ));
            Some(ConsoleServer::bind(
                &cfg.console_bind,
                cfg.console_port,
                console,
            )?)
        } else {
            None
        };

        Ok(Self {
            cfg,
            hub,
            engine,
            net,
            cell,
            console,
        })
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn net(&self) -> &NetManager {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut NetManager {
        &mut self.net
    }

    pub fn cell(&self) -> Option<&CellSupervisor> {
        self.cell.as_ref()
    }

    pub fn cell_mut(&mut self) -> Option<&mut CellSupervisor> {
        self.cell.as_mut()
    }

    /// The console server's actual listen port (0 when disabled).
    pub fn console_port(&self) -> u16 {
        self.console.as_ref().map_or(0, ConsoleServer::port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.cfg.storage.shutdown_grace
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.cfg
    }
}
