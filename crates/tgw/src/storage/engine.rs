// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The MM2 store: per-sensor sector chains with per-upload-source cursors.
//!
//! Producers append time-series (TSD) or event (EVT) records to a sensor's
//! singly-linked chain of pool sectors. Each upload source owns an
//! independent read cursor and pending window over the shared chain; the
//! underlying slots are zeroed and sectors freed only once every source in
//! the sensor's mask has acknowledged past them.
//!
//! # Cursor model
//!
//! Records of a sensor are numbered absolutely from sensor creation. Per
//! source the engine keeps three positions into the RAM stream:
//!
//! ```text
//!   acked_abs <= read_abs <= hwm_abs
//!   pending window = [acked_abs, hwm_abs)
//! ```
//!
//! A bulk read advances `read_abs` (and the high-water mark). ACK moves
//! `acked_abs` up to the high-water mark and physically erases the prefix
//! every source has passed. NACK rewinds `read_abs` to `acked_abs`, leaving
//! the window - and therefore the pending count - intact, so the next read
//! returns byte-identical records.
//!
//! The same triple exists for the source's disk stream once records have
//! spilled; `pending_count` reports the sum of both portions and
//! `pending_start_sector` is `NONE` while the window holds no RAM records.

use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::{GatewayConfig, GpsSensors, SensorConfig, UploadSource};
use crate::diag::{DiagEvent, Hub, DBG_STORAGE};
use crate::error::{Error, Result};
use crate::storage::pool::SectorPool;
use crate::storage::sector::{Sector, SectorId, SectorKind};
use crate::storage::spool::{DiskSpool, SpillRecords};
use crate::storage::Record;

/// Interval between "records dropped" log lines under sustained pressure.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Wall-clock UTC in milliseconds.
pub fn utc_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Injectable UTC-millisecond clock (tests replace the wall clock).
pub type UtcClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// A GPS fix as read from the positioning subsystem.
#[derive(Debug, Clone, Copy)]
pub struct GpsFix {
    pub latitude: f32,
    pub longitude: f32,
    pub altitude_m: f32,
    pub speed_mps: f32,
}

/// Provider of the current GPS fix, registered by the GPS adapter.
pub trait GpsProvider: Send + Sync {
    fn current_fix(&self) -> Option<GpsFix>;
}

/// Per-upload-source tracking record.
#[derive(Debug, Clone, Copy)]
struct SourceCursor {
    /// Source consumes this sensor (mask membership).
    enabled: bool,
    /// RAM stream: everything below is acknowledged.
    acked_abs: u64,
    /// RAM stream: next record a bulk read returns.
    read_abs: u64,
    /// RAM stream: furthest position ever read; the pending window is
    /// `[acked_abs, hwm_abs)` and survives a NACK rewind.
    hwm_abs: u64,
    /// Chain position of `acked_abs`, kept for the observable API;
    /// `NONE` while the pending window holds no RAM records.
    pending_start_sector: SectorId,
    pending_start_offset: u8,
    /// Disk stream counterparts (records, in spill order).
    disk_appended: u64,
    disk_acked: u64,
    disk_read: u64,
    disk_hwm: u64,
}

impl SourceCursor {
    fn disabled() -> Self {
        Self {
            enabled: false,
            acked_abs: 0,
            read_abs: 0,
            hwm_abs: 0,
            pending_start_sector: SectorId::NONE,
            pending_start_offset: 0,
            disk_appended: 0,
            disk_acked: 0,
            disk_read: 0,
            disk_hwm: 0,
        }
    }

    fn pending_ram(&self) -> u64 {
        self.hwm_abs - self.acked_abs
    }

    fn pending_disk(&self) -> u64 {
        self.disk_hwm - self.disk_acked
    }

    fn pending(&self) -> u64 {
        self.pending_ram() + self.pending_disk()
    }
}

/// Mutable per-sensor state (the SCB), guarded by a per-sensor lock.
#[derive(Debug)]
struct SensorState {
    start_sector: SectorId,
    end_sector: SectorId,
    /// Records in the end sector (mirrors its `written` count).
    write_offset: u8,
    /// Sectors currently in the chain. Bookkeeping for spill ordering only;
    /// the public `sector_count` always walks the chain.
    chain_len: u32,
    /// Absolute index of slot 0 of the start sector.
    chain_first_abs: u64,
    /// Absolute index of the next record to append.
    written_total: u64,
    /// Live (unerased) records currently in RAM.
    ram_live: u64,
    /// Chain quarantined after corruption; writes and erases rejected.
    degraded: bool,
    /// Records dropped under pool pressure.
    dropped: u64,
    last_drop_log: Option<Instant>,
    cursors: [SourceCursor; UploadSource::COUNT],
}

struct SensorSlot {
    cfg: SensorConfig,
    state: PlMutex<SensorState>,
}

/// The tiered storage engine.
pub struct StorageEngine {
    pool: Arc<SectorPool>,
    hub: Arc<Hub>,
    sensors: Vec<SensorSlot>,
    index: HashMap<u16, usize>,
    spool: Option<PlMutex<DiskSpool>>,
    gps: PlMutex<Option<Arc<dyn GpsProvider>>>,
    gps_ids: Option<GpsSensors>,
    clock: UtcClock,
    high_water_pct: u8,
    spill_target_pct: u8,
}

impl StorageEngine {
    /// Build the engine from a validated configuration.
    pub fn new(cfg: &GatewayConfig, pool: Arc<SectorPool>, hub: Arc<Hub>) -> Result<Self> {
        Self::with_clock(cfg, pool, hub, Arc::new(utc_now_ms))
    }

    /// Build with an explicit clock (tests inject synthetic time).
    pub fn with_clock(
        cfg: &GatewayConfig,
        pool: Arc<SectorPool>,
        hub: Arc<Hub>,
        clock: UtcClock,
    ) -> Result<Self> {
        let mut sensors = Vec::with_capacity(cfg.sensors.len());
        let mut index = HashMap::new();
        for sensor_cfg in &cfg.sensors {
            let mut cursors = [SourceCursor::disabled(); UploadSource::COUNT];
            for source in sensor_cfg.sources.iter() {
                cursors[source.index()].enabled = true;
            }
            index.insert(sensor_cfg.id, sensors.len());
            sensors.push(SensorSlot {
                cfg: sensor_cfg.clone(),
                state: PlMutex::new(SensorState {
                    start_sector: SectorId::NONE,
                    end_sector: SectorId::NONE,
                    write_offset: 0,
                    chain_len: 0,
                    chain_first_abs: 0,
                    written_total: 0,
                    ram_live: 0,
                    degraded: false,
                    dropped: 0,
                    last_drop_log: None,
                    cursors,
                }),
            });
        }

        let spool = if cfg.storage.spool_enabled {
            Some(PlMutex::new(DiskSpool::new(
                &cfg.storage.spool_dir,
                cfg.storage.spool_file_cap_bytes,
                hub.clone(),
            )?))
        } else {
            None
        };

        Ok(Self {
            pool,
            hub,
            sensors,
            index,
            spool,
            gps: PlMutex::new(None),
            gps_ids: cfg.gps,
            clock,
            high_water_pct: cfg.storage.high_water_pct,
            spill_target_pct: cfg.storage.spill_target_pct,
        })
    }

    /// Run disk spillover recovery and restore per-source disk counters.
    ///
    /// Must run before producers start writing.
    pub fn recover(&self) -> Result<()> {
        let Some(spool) = &self.spool else {
            return Ok(());
        };
        let counts = spool.lock().recover()?;
        for ((source, sensor), count) in counts {
            let Some(&slot_idx) = self.index.get(&sensor) else {
                log::warn!(
                    "[StorageEngine::recover] spool holds unknown sensor {}, leaving files",
                    sensor
                );
                continue;
            };
            let mut st = self.sensors[slot_idx].state.lock();
            let cur = &mut st.cursors[source.index()];
            if cur.enabled {
                cur.disk_appended = count;
            }
        }
        Ok(())
    }

    /// Register the GPS fix provider used by `write_evt_with_gps`.
    pub fn register_gps_provider(&self, provider: Arc<dyn GpsProvider>) {
        *self.gps.lock() = Some(provider);
    }

    /// The pool backing this engine.
    pub fn pool(&self) -> &SectorPool {
        &self.pool
    }

    /// Configured sensor ids, in arena order.
    pub fn sensor_ids(&self) -> Vec<u16> {
        self.sensors.iter().map(|s| s.cfg.id).collect()
    }

    /// Sensor display name.
    pub fn sensor_name(&self, sensor: u16) -> Option<&str> {
        self.index
            .get(&sensor)
            .map(|&i| self.sensors[i].cfg.name.as_str())
    }

    fn slot(&self, sensor: u16) -> Result<&SensorSlot> {
        let idx = *self
            .index
            .get(&sensor)
            .ok_or(Error::SensorUnknown(sensor))?;
        Ok(&self.sensors[idx])
    }

    // ======================================================================
    // Producer API
    // ======================================================================

    /// Append one time-series value; the engine stamps it from its clock
    /// when a fresh sector is opened.
    pub fn write_tsd(&self, sensor: u16, value: u32) -> Result<()> {
        let slot = self.slot(sensor)?;
        if slot.cfg.kind != SectorKind::Tsd {
            return Err(Error::ConfigInvalid(format!(
                "sensor {} is not a TSD sensor",
                sensor
            )));
        }
        let mut st = slot.state.lock();
        self.append(slot, &mut st, |s| s.push_tsd(value))
    }

    /// Append one event with an explicit UTC-millisecond timestamp.
    pub fn write_evt(&self, sensor: u16, value: u32, utc_ms: u64) -> Result<()> {
        let slot = self.slot(sensor)?;
        if slot.cfg.kind != SectorKind::Evt {
            return Err(Error::ConfigInvalid(format!(
                "sensor {} is not an EVT sensor",
                sensor
            )));
        }
        let mut st = slot.state.lock();
        self.append(slot, &mut st, |s| s.push_evt(value, utc_ms))
    }

    /// Append an event plus the four GPS companion records, all carrying
    /// the same `utc_ms`.
    ///
    /// The fix is read inline from the registered provider; without a fix
    /// (or a provider) only the event itself is written.
    pub fn write_evt_with_gps(&self, sensor: u16, value: u32, utc_ms: u64) -> Result<()> {
        self.write_evt(sensor, value, utc_ms)?;

        let Some(ids) = self.gps_ids else {
            return Ok(());
        };
        let fix = self.gps.lock().as_ref().and_then(|p| p.current_fix());
        let Some(fix) = fix else {
            crate::diag_debug!(
                DBG_STORAGE,
                "[StorageEngine::write_evt_with_gps] no fix, companions skipped for sensor {}",
                sensor
            );
            return Ok(());
        };

        self.write_evt(ids.latitude, fix.latitude.to_bits(), utc_ms)?;
        self.write_evt(ids.longitude, fix.longitude.to_bits(), utc_ms)?;
        self.write_evt(ids.altitude, fix.altitude_m.to_bits(), utc_ms)?;
        self.write_evt(ids.speed, fix.speed_mps.to_bits(), utc_ms)?;
        Ok(())
    }

    /// Shared append path: ensure chain capacity, write one record.
    fn append(
        &self,
        slot: &SensorSlot,
        st: &mut SensorState,
        push: impl FnOnce(&mut Sector),
    ) -> Result<()> {
        if st.degraded {
            return Err(Error::SensorDegraded(slot.cfg.id));
        }

        let needs_sector =
            st.end_sector.is_none() || self.pool.with_sector(st.end_sector, Sector::is_full)?;
        if needs_sector {
            let id = self.allocate_with_pressure(slot, st)?;

            if slot.cfg.kind == SectorKind::Tsd {
                let now_ms = (self.clock)();
                self.pool.with_sector_mut(id, |s| s.set_tsd_base(now_ms))?;
            }

            if st.end_sector.is_none() {
                st.start_sector = id;
                st.chain_first_abs = st.written_total;
            } else {
                self.pool.set_next_in_chain(st.end_sector, id)?;
            }
            st.end_sector = id;
            st.write_offset = 0;
            st.chain_len += 1;
        }

        self.pool.with_sector_mut(st.end_sector, push)?;
        st.write_offset += 1;
        st.written_total += 1;
        st.ram_live += 1;
        Ok(())
    }

    /// Allocate a sector, spilling under pressure: first other sensors'
    /// chains (skipping contended locks), then this sensor's own head as a
    /// last resort. Failing all that, the record is dropped.
    fn allocate_with_pressure(&self, slot: &SensorSlot, st: &mut SensorState) -> Result<SectorId> {
        match self.pool.allocate(slot.cfg.kind) {
            Ok(id) => return Ok(id),
            Err(Error::PoolFull) => {}
            Err(e) => return Err(e),
        }

        let _ = self.spill_pass(self.spill_target_pct)?;
        match self.pool.allocate(slot.cfg.kind) {
            Ok(id) => return Ok(id),
            Err(Error::PoolFull) => {}
            Err(e) => return Err(e),
        }

        if let Some(spool) = &self.spool {
            while self.head_spillable(st)? {
                self.spill_head(slot, st, &mut spool.lock())?;
                match self.pool.allocate(slot.cfg.kind) {
                    Ok(id) => return Ok(id),
                    Err(Error::PoolFull) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Err(self.record_drop(slot, st))
    }

    /// Count a dropped record, log at most once per interval.
    fn record_drop(&self, slot: &SensorSlot, st: &mut SensorState) -> Error {
        st.dropped += 1;
        let due = st
            .last_drop_log
            .map_or(true, |at| at.elapsed() >= DROP_LOG_INTERVAL);
        if due {
            log::warn!(
                "[StorageEngine] sensor {}: pool exhausted and spillover unavailable, {} records dropped so far",
                slot.cfg.id,
                st.dropped
            );
            st.last_drop_log = Some(Instant::now());
        }
        Error::OutOfStorage
    }

    // ======================================================================
    // Consumer API
    // ======================================================================

    /// True when `source` has read records of `sensor` more recently than
    /// it acknowledged or reverted them.
    pub fn has_pending(&self, source: UploadSource, sensor: u16) -> Result<bool> {
        let slot = self.slot(sensor)?;
        let st = slot.state.lock();
        let cur = &st.cursors[source.index()];
        Ok(cur.read_abs > cur.acked_abs || cur.disk_read > cur.disk_acked)
    }

    /// Combined (disk + RAM) pending record count for the source's window.
    pub fn pending_count(&self, source: UploadSource, sensor: u16) -> Result<u32> {
        let slot = self.slot(sensor)?;
        let st = slot.state.lock();
        Ok(st.cursors[source.index()].pending() as u32)
    }

    /// Chain position the pending window starts at, `NONE` while the
    /// window holds no RAM records (disk-only pending).
    pub fn pending_start(&self, source: UploadSource, sensor: u16) -> Result<(SectorId, u8)> {
        let slot = self.slot(sensor)?;
        let st = slot.state.lock();
        let cur = &st.cursors[source.index()];
        Ok((cur.pending_start_sector, cur.pending_start_offset))
    }

    /// Read up to `max` records for `source`, oldest first: the source's
    /// disk backlog drains before RAM so read order equals write order.
    pub fn read_bulk(&self, source: UploadSource, sensor: u16, max: usize) -> Result<Vec<Record>> {
        let slot = self.slot(sensor)?;
        let mut st = slot.state.lock();
        let idx = source.index();
        if !st.cursors[idx].enabled || max == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();

        // Disk backlog first (strictly older than anything in RAM).
        if st.cursors[idx].disk_read < st.cursors[idx].disk_appended {
            if let Some(spool) = &self.spool {
                let got = spool
                    .lock()
                    .read(
                        source,
                        sensor,
                        st.cursors[idx].disk_read,
                        max,
                        slot.cfg.period_ms,
                    )
                    .map_err(crate::Error::from)?;
                let cur = &mut st.cursors[idx];
                cur.disk_read += got.len() as u64;
                if cur.disk_read > cur.disk_hwm {
                    cur.disk_hwm = cur.disk_read;
                }
                out.extend(got);
            }
        }

        // Then RAM.
        if out.len() < max && st.cursors[idx].read_abs < st.written_total {
            let from_abs = st.cursors[idx].read_abs;
            let opening = st.cursors[idx].pending_ram() == 0;
            if opening {
                let (sector, offset) = match self.locate(slot, &st, from_abs) {
                    Ok(pos) => pos,
                    Err(e) => {
                        Self::quarantine_locked(slot, &mut st, "read cursor off the chain");
                        return Err(e);
                    }
                };
                let cur = &mut st.cursors[idx];
                cur.pending_start_sector = sector;
                cur.pending_start_offset = offset;
            }
            let got = match self.collect_ram(slot, &st, from_abs, max - out.len()) {
                Ok(got) => got,
                Err(e @ Error::ChainCorruption(_)) => {
                    Self::quarantine_locked(slot, &mut st, "chain walk failed during read");
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let cur = &mut st.cursors[idx];
            cur.read_abs += got.len() as u64;
            if cur.read_abs > cur.hwm_abs {
                cur.hwm_abs = cur.read_abs;
            }
            out.extend(got);
        }

        if !out.is_empty() {
            self.hub.publish(&DiagEvent::PendingOpened {
                source: idx as u8,
                sensor,
                count: out.len() as u32,
            });
        }
        Ok(out)
    }

    /// Acknowledge the source's pending window.
    ///
    /// Clears the per-source window, then physically erases every record
    /// all mask sources have now passed: slots are zeroed, completely empty
    /// sectors are unlinked and returned to the pool. With disk pending the
    /// acknowledged stream position moves and the disk cleanup hook deletes
    /// any spillover file that is now fully acknowledged.
    pub fn erase_all_pending(&self, source: UploadSource, sensor: u16) -> Result<()> {
        let slot = self.slot(sensor)?;
        let mut st = slot.state.lock();
        if st.degraded {
            return Err(Error::SensorDegraded(sensor));
        }
        let idx = source.index();

        let pend_ram = st.cursors[idx].pending_ram();
        let pend_disk = st.cursors[idx].pending_disk();
        let pending = pend_ram + pend_disk;
        if pending == 0 {
            return Ok(());
        }

        if pend_disk > 0 {
            let cur = &mut st.cursors[idx];
            cur.disk_acked = cur.disk_hwm;
            if cur.disk_read < cur.disk_acked {
                cur.disk_read = cur.disk_acked;
            }
            let acked = cur.disk_acked;
            if let Some(spool) = &self.spool {
                spool.lock().ack(source, sensor, acked);
            }
        }

        if pend_ram > 0 {
            {
                let cur = &mut st.cursors[idx];
                cur.acked_abs = cur.hwm_abs;
                if cur.read_abs < cur.acked_abs {
                    cur.read_abs = cur.acked_abs;
                }
                cur.pending_start_sector = SectorId::NONE;
                cur.pending_start_offset = 0;
            }

            let first_live = self.first_live_abs(&st)?;
            let min_acked = st
                .cursors
                .iter()
                .filter(|c| c.enabled)
                .map(|c| c.acked_abs)
                .min()
                .unwrap_or(0);
            debug_assert!(min_acked >= first_live, "acked position behind live prefix");
            let erasable = min_acked.saturating_sub(first_live);
            if erasable > 0 {
                self.physically_erase(slot, &mut st, erasable)?;
            }
        }

        // Disk cleanup hook: delete spillover files this source has fully
        // acknowledged.
        if let Some(spool) = &self.spool {
            spool.lock().cleanup(source).map_err(crate::Error::from)?;
        }

        self.hub.publish(&DiagEvent::EraseDone {
            source: idx as u8,
            sensor,
            erased: pending as u32,
        });
        crate::diag_debug!(
            DBG_STORAGE,
            "[StorageEngine::erase_all_pending] {}/{}: acked {} records",
            source,
            sensor,
            pending
        );
        Ok(())
    }

    /// Reject the source's pending window: rewind the read cursors to the
    /// window start, keep the pending count, so the next `read_bulk`
    /// returns the identical records.
    pub fn revert_all_pending(&self, source: UploadSource, sensor: u16) -> Result<()> {
        let slot = self.slot(sensor)?;
        let mut st = slot.state.lock();
        let cur = &mut st.cursors[source.index()];
        cur.read_abs = cur.acked_abs;
        cur.disk_read = cur.disk_acked;
        let pending = cur.pending() as u32;

        self.hub.publish(&DiagEvent::RevertDone {
            source: source.index() as u8,
            sensor,
            pending,
        });
        Ok(())
    }

    /// Drop a quarantined sensor's pending window for `source` without
    /// touching the chain (recovery escape hatch after `ChainCorruption`).
    pub fn force_drop_pending(&self, source: UploadSource, sensor: u16) -> Result<()> {
        let slot = self.slot(sensor)?;
        let mut st = slot.state.lock();
        let cur = &mut st.cursors[source.index()];
        cur.acked_abs = cur.hwm_abs;
        cur.read_abs = cur.hwm_abs;
        cur.disk_acked = cur.disk_hwm;
        cur.disk_read = cur.disk_hwm;
        cur.pending_start_sector = SectorId::NONE;
        cur.pending_start_offset = 0;
        log::warn!(
            "[StorageEngine::force_drop_pending] {}/{}: pending window discarded",
            source,
            sensor
        );
        Ok(())
    }

    // ======================================================================
    // Observability
    // ======================================================================

    /// Number of sectors in the sensor's chain, by walking it.
    ///
    /// The free list hands out sector IDs in arbitrary order, so the
    /// difference between tail and head IDs is meaningless; only the walk
    /// is correct.
    pub fn sector_count(&self, sensor: u16) -> Result<u32> {
        let slot = self.slot(sensor)?;
        let st = slot.state.lock();
        let mut count = 0u32;
        let mut id = st.start_sector;
        while id.is_some() {
            count += 1;
            if count as usize > self.pool.total_sectors() {
                return Err(Error::ChainCorruption(sensor));
            }
            if id == st.end_sector {
                return Ok(count);
            }
            id = self.pool.next_in_chain(id)?;
        }
        if count == 0 && st.start_sector.is_none() {
            return Ok(0);
        }
        // Walk fell off the chain before reaching the end sector.
        Err(Error::ChainCorruption(sensor))
    }

    /// Records physically present for the sensor: live RAM records plus
    /// disk records not yet acknowledged by every mask source.
    pub fn total_records(&self, sensor: u16) -> Result<u64> {
        let slot = self.slot(sensor)?;
        let st = slot.state.lock();
        let disk = st
            .cursors
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.disk_appended - c.disk_acked)
            .max()
            .unwrap_or(0);
        Ok(st.ram_live + disk)
    }

    /// Records dropped under pool pressure.
    pub fn dropped(&self, sensor: u16) -> Result<u64> {
        Ok(self.slot(sensor)?.state.lock().dropped)
    }

    /// Payload bytes holding live records versus gross bytes of the used
    /// sectors (a full TSD sector stores 24 data bytes in 32: 75%).
    pub fn storage_efficiency_pct(&self) -> u8 {
        let used = self.pool.total_sectors() - self.pool.free_sectors();
        if used == 0 {
            return 0;
        }
        let mut net_bytes = 0u64;
        for slot in &self.sensors {
            let per_record = match slot.cfg.kind {
                SectorKind::Tsd => 4u64,
                SectorKind::Evt => 12u64,
            };
            net_bytes += slot.state.lock().ram_live * per_record;
        }
        ((net_bytes * 100) / (used as u64 * crate::storage::sector::SECTOR_PAYLOAD as u64)) as u8
    }

    /// True when the sensor's chain is quarantined.
    pub fn is_degraded(&self, sensor: u16) -> Result<bool> {
        Ok(self.slot(sensor)?.state.lock().degraded)
    }

    // ======================================================================
    // Spillover & maintenance
    // ======================================================================

    /// Periodic maintenance: spill chains once the pool runs past the
    /// high-water mark. Called from the scheduler tick.
    pub fn maintain(&self) -> Result<usize> {
        if self.pool.usage_percent() < self.high_water_pct {
            return Ok(0);
        }
        self.spill_pass(self.spill_target_pct)
    }

    /// Shutdown flush: spill every spillable sector of every chain.
    pub fn flush_all(&self) -> Result<usize> {
        self.spill_pass(0)
    }

    /// Spill head sectors, longest chains first, until usage drops below
    /// `target_pct` (0 = spill everything eligible). Contended sensor locks
    /// are skipped, which also keeps a sensor from spilling itself from
    /// inside its own write path.
    fn spill_pass(&self, target_pct: u8) -> Result<usize> {
        let Some(spool) = &self.spool else {
            return Ok(0);
        };
        let mut freed = 0usize;

        loop {
            if target_pct > 0 && self.pool.usage_percent() < target_pct {
                break;
            }

            // Longest spillable chain wins this round.
            let mut best: Option<(usize, u32)> = None;
            for (i, slot) in self.sensors.iter().enumerate() {
                let Some(st) = slot.state.try_lock() else {
                    continue;
                };
                if st.degraded || st.start_sector.is_none() {
                    continue;
                }
                if !self.head_spillable(&st)? {
                    continue;
                }
                if st.chain_len > best.map_or(0, |(_, len)| len) {
                    best = Some((i, st.chain_len));
                }
            }
            let Some((i, _)) = best else { break };

            let slot = &self.sensors[i];
            let Some(mut st) = slot.state.try_lock() else {
                break;
            };
            if !self.head_spillable(&st)? || st.start_sector.is_none() {
                break;
            }
            self.spill_head(slot, &mut st, &mut spool.lock())?;
            freed += 1;
        }
        Ok(freed)
    }

    /// A head sector may spill only when every mask source's window sits
    /// exactly at the chain's first live record: nobody has read into the
    /// sector and nobody holds a pending window over it, so each source's
    /// spool file receives the complete record set and a NACK rewind can
    /// never point into freed RAM.
    fn head_spillable(&self, st: &SensorState) -> Result<bool> {
        if st.start_sector.is_none() {
            return Ok(false);
        }
        let first_live = self.first_live_abs(st)?;
        Ok(st
            .cursors
            .iter()
            .filter(|c| c.enabled)
            .all(|c| c.hwm_abs == first_live))
    }

    fn first_live_abs(&self, st: &SensorState) -> Result<u64> {
        if st.start_sector.is_none() {
            return Ok(st.written_total);
        }
        let erased = self.pool.with_sector(st.start_sector, |s| s.erased())?;
        Ok(st.chain_first_abs + u64::from(erased))
    }

    /// Move the chain's head sector to each mask source's spool file and
    /// free it.
    fn spill_head(
        &self,
        slot: &SensorSlot,
        st: &mut SensorState,
        spool: &mut DiskSpool,
    ) -> Result<()> {
        let head = st.start_sector;
        let (records, written) = self.pool.with_sector(head, |s| {
            let recs = match s.kind() {
                SectorKind::Tsd => SpillRecords::Tsd {
                    base_ms: s.tsd_base()
                        + u64::from(s.erased()) * u64::from(slot.cfg.period_ms),
                    values: (s.erased()..s.written()).map(|i| s.tsd_value(i)).collect(),
                },
                SectorKind::Evt => SpillRecords::Evt {
                    pairs: (s.erased()..s.written()).map(|i| s.evt_pair(i)).collect(),
                },
            };
            (recs, s.written())
        })?;

        let live = match &records {
            SpillRecords::Tsd { values, .. } => values.len() as u64,
            SpillRecords::Evt { pairs } => pairs.len() as u64,
        };
        if live > 0 {
            for source in slot.cfg.sources.iter() {
                spool
                    .append(source, slot.cfg.id, &records)
                    .map_err(crate::Error::from)?;
            }
        }

        // Unlink the head and move every enabled cursor to the new chain
        // start (the spill precondition pinned them all at the old one).
        let next = self.pool.next_in_chain(head)?;
        st.start_sector = next;
        st.chain_first_abs += u64::from(written);
        st.chain_len -= 1;
        if next.is_none() {
            st.end_sector = SectorId::NONE;
            st.write_offset = 0;
        }
        self.pool.free(head);
        st.ram_live -= live;

        let new_first = st.chain_first_abs;
        for cur in st.cursors.iter_mut().filter(|c| c.enabled) {
            cur.acked_abs = new_first;
            cur.read_abs = new_first;
            cur.hwm_abs = new_first;
            cur.disk_appended += live;
        }
        Ok(())
    }

    // ======================================================================
    // Chain internals
    // ======================================================================

    /// Map an absolute record index to its chain position.
    fn locate(&self, slot: &SensorSlot, st: &SensorState, abs: u64) -> Result<(SectorId, u8)> {
        let mut id = st.start_sector;
        let mut first = st.chain_first_abs;
        let mut hops = 0usize;
        while id.is_some() {
            let written = self.pool.with_sector(id, |s| s.written())?;
            if abs < first + u64::from(written) {
                return Ok((id, (abs - first) as u8));
            }
            first += u64::from(written);
            id = self.pool.next_in_chain(id)?;
            hops += 1;
            if hops > self.pool.total_sectors() {
                break;
            }
        }
        Err(Error::ChainCorruption(slot.cfg.id))
    }

    /// Decode up to `max` records starting at `from_abs`.
    fn collect_ram(
        &self,
        slot: &SensorSlot,
        st: &SensorState,
        from_abs: u64,
        max: usize,
    ) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        let mut id = st.start_sector;
        let mut first = st.chain_first_abs;
        let mut abs = from_abs;
        let mut hops = 0usize;

        while abs < st.written_total && out.len() < max {
            if id.is_none() {
                return Err(Error::ChainCorruption(slot.cfg.id));
            }
            let written = u64::from(self.pool.with_sector(id, |s| s.written())?);

            // Skip sectors entirely before the cursor position.
            if abs >= first + written {
                first += written;
                id = self.pool.next_in_chain(id)?;
                hops += 1;
                if hops > self.pool.total_sectors() {
                    return Err(Error::ChainCorruption(slot.cfg.id));
                }
                continue;
            }

            let want = (max - out.len()).min((first + written - abs) as usize);
            let records = self.pool.with_sector(id, |s| {
                let mut records = Vec::with_capacity(want);
                for i in 0..want {
                    let slot_idx = (abs + i as u64 - first) as u8;
                    records.push(match s.kind() {
                        SectorKind::Tsd => Record {
                            sensor: slot.cfg.id,
                            value: s.tsd_value(slot_idx),
                            utc_ms: s.tsd_stamp(slot_idx, slot.cfg.period_ms),
                        },
                        SectorKind::Evt => {
                            let (value, utc_ms) = s.evt_pair(slot_idx);
                            Record {
                                sensor: slot.cfg.id,
                                value,
                                utc_ms,
                            }
                        }
                    });
                }
                records
            })?;
            abs += records.len() as u64;
            out.extend(records);
        }
        Ok(out)
    }

    /// Zero `count` records from the chain's live prefix, unlinking and
    /// freeing sectors as they empty.
    fn physically_erase(&self, slot: &SensorSlot, st: &mut SensorState, count: u64) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let head = st.start_sector;
            if head.is_none() {
                Self::quarantine_locked(slot, st, "erase ran past the end of the chain");
                return Err(Error::ChainCorruption(slot.cfg.id));
            }

            let (erased_now, empty, written) = self.pool.with_sector_mut(head, |s| {
                let mut n = 0u64;
                while n < remaining && s.erased() < s.written() {
                    s.erase_next();
                    n += 1;
                }
                (n, s.is_completely_empty(), s.written())
            })?;

            if erased_now > 0 {
                self.hub.publish(&DiagEvent::SectorErased {
                    sensor: slot.cfg.id,
                    sector: head.raw() as u32,
                });
            }
            remaining -= erased_now;

            if empty {
                let next = self.pool.next_in_chain(head)?;
                st.start_sector = next;
                st.chain_first_abs += u64::from(written);
                st.chain_len -= 1;
                if next.is_none() {
                    st.end_sector = SectorId::NONE;
                    st.write_offset = 0;
                }
                self.pool.free(head);
                self.hub.publish(&DiagEvent::ChainUnlinked {
                    sensor: slot.cfg.id,
                    sector: head.raw() as u32,
                });
            } else if remaining > 0 {
                // Sector neither exhausted nor empty yet records remain:
                // the accounting and the chain disagree.
                Self::quarantine_locked(slot, st, "erase stalled inside a sector");
                return Err(Error::ChainCorruption(slot.cfg.id));
            }
        }
        st.ram_live -= count;
        Ok(())
    }

    /// Quarantine the sensor: keep the chain for post-mortem, reject new
    /// writes and erases, leave the process up.
    fn quarantine_locked(slot: &SensorSlot, st: &mut SensorState, reason: &str) {
        st.degraded = true;
        log::error!(
            "[StorageEngine] FATAL: sensor {} chain corrupt ({}), quarantining",
            slot.cfg.id,
            reason
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SensorConfig, SourceMask};
    use crate::net::iface::{IfaceConfig, IfaceKind};
    use tempfile::TempDir;

    const GW: UploadSource = UploadSource::Gateway;
    const HD: UploadSource = UploadSource::HostedDevice;

    struct Fixture {
        engine: Arc<StorageEngine>,
        hub: Arc<Hub>,
        _spool_dir: Option<TempDir>,
    }

    fn fixture(pool_sectors: usize, spool: bool) -> Fixture {
        let dir = spool.then(|| TempDir::new().expect("tempdir"));
        let mut cfg = GatewayConfig::default()
            .with_sensor(SensorConfig::tsd(42, "rpm", 250, SourceMask::of(&[GW])))
            .with_sensor(SensorConfig::tsd(7, "coolant", 1000, SourceMask::of(&[GW, HD])))
            .with_sensor(SensorConfig::evt(9, "impact", SourceMask::of(&[GW])))
            .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
        cfg.net.anchor_host = "probe.example.net".into();
        cfg.storage.pool_sectors = pool_sectors;
        cfg.storage.spool_enabled = spool;
        if let Some(dir) = &dir {
            cfg.storage.spool_dir = dir.path().to_path_buf();
        }
        cfg.validate().expect("valid config");

        let hub = Arc::new(Hub::new());
        let pool = Arc::new(SectorPool::new(pool_sectors, hub.clone()).expect("pool"));
        let clock: UtcClock = Arc::new(|| 1_700_000_000_000);
        let engine =
            Arc::new(StorageEngine::with_clock(&cfg, pool, hub.clone(), clock).expect("engine"));
        Fixture {
            engine,
            hub,
            _spool_dir: dir,
        }
    }

    #[test]
    fn test_normal_upload_cycle() {
        let f = fixture(32, false);
        let engine = &f.engine;
        let free_before = engine.pool().free_sectors();

        for i in 0..18u32 {
            engine.write_tsd(42, i).expect("write");
        }
        assert_eq!(engine.total_records(42).expect("total"), 18);
        assert_eq!(engine.sector_count(42).expect("count"), 3);
        assert_eq!(engine.pool().free_sectors(), free_before - 3);

        let records = engine.read_bulk(GW, 42, 100).expect("read");
        assert_eq!(records.len(), 18);
        let values: Vec<u32> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, (0..18).collect::<Vec<u32>>());
        assert!(engine.has_pending(GW, 42).expect("pending"));

        engine.erase_all_pending(GW, 42).expect("erase");
        assert_eq!(engine.total_records(42).expect("total"), 0);
        assert_eq!(engine.sector_count(42).expect("count"), 0);
        assert_eq!(engine.pool().free_sectors(), free_before);
        assert!(!engine.has_pending(GW, 42).expect("pending"));
    }

    #[test]
    fn test_tsd_timestamps_follow_period() {
        let f = fixture(16, false);
        for i in 0..8u32 {
            f.engine.write_tsd(42, i).expect("write");
        }
        let records = f.engine.read_bulk(GW, 42, 100).expect("read");
        // First sector: base + slot * 250 ms; second sector restarts at base.
        assert_eq!(records[0].utc_ms, 1_700_000_000_000);
        assert_eq!(records[5].utc_ms, 1_700_000_000_000 + 5 * 250);
        assert_eq!(records[6].utc_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_nack_then_retry_returns_identical_records() {
        let f = fixture(32, false);
        let engine = &f.engine;
        for i in 0..18u32 {
            engine.write_tsd(42, i).expect("write");
        }

        let first = engine.read_bulk(GW, 42, 100).expect("read");
        assert_eq!(first.len(), 18);
        engine.revert_all_pending(GW, 42).expect("revert");
        assert!(!engine.has_pending(GW, 42).expect("pending"));
        assert_eq!(engine.pending_count(GW, 42).expect("count"), 18);

        let second = engine.read_bulk(GW, 42, 100).expect("read");
        assert_eq!(first, second);

        engine.erase_all_pending(GW, 42).expect("erase");
        assert_eq!(engine.total_records(42).expect("total"), 0);
        assert_eq!(engine.sector_count(42).expect("count"), 0);
    }

    #[test]
    fn test_two_sources_share_one_chain() {
        let f = fixture(32, false);
        let engine = &f.engine;
        let free_initial = engine.pool().free_sectors();

        for i in 0..12u32 {
            engine.write_tsd(7, i).expect("write");
        }

        let a = engine.read_bulk(GW, 7, 100).expect("read A");
        let b = engine.read_bulk(HD, 7, 100).expect("read B");
        assert_eq!(a.len(), 12);
        assert_eq!(a, b, "independent cursors over the same data");

        engine.erase_all_pending(GW, 7).expect("erase A");
        // B has not acknowledged: the chain must survive.
        assert_eq!(engine.sector_count(7).expect("count"), 2);
        assert_eq!(engine.total_records(7).expect("total"), 12);

        engine.erase_all_pending(HD, 7).expect("erase B");
        assert_eq!(engine.sector_count(7).expect("count"), 0);
        assert_eq!(engine.total_records(7).expect("total"), 0);
        assert_eq!(engine.pool().free_sectors(), free_initial);
    }

    #[test]
    fn test_partial_reads_accumulate_pending() {
        let f = fixture(32, false);
        let engine = &f.engine;
        for i in 0..10u32 {
            engine.write_tsd(42, i).expect("write");
        }

        let first = engine.read_bulk(GW, 42, 4).expect("read");
        assert_eq!(first.len(), 4);
        let second = engine.read_bulk(GW, 42, 4).expect("read");
        assert_eq!(second.len(), 4);
        assert_eq!(engine.pending_count(GW, 42).expect("count"), 8);

        engine.erase_all_pending(GW, 42).expect("erase");
        assert_eq!(engine.total_records(42).expect("total"), 2);

        let rest = engine.read_bulk(GW, 42, 100).expect("read");
        let values: Vec<u32> = rest.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![8, 9]);
    }

    #[test]
    fn test_evt_records_carry_explicit_stamps() {
        let f = fixture(16, false);
        let engine = &f.engine;
        engine.write_evt(9, 0xA, 111).expect("write");
        engine.write_evt(9, 0xB, 222).expect("write");
        engine.write_evt(9, 0xC, 333).expect("write");
        assert_eq!(engine.sector_count(9).expect("count"), 2);

        let records = engine.read_bulk(GW, 9, 10).expect("read");
        assert_eq!(
            records,
            vec![
                Record { sensor: 9, value: 0xA, utc_ms: 111 },
                Record { sensor: 9, value: 0xB, utc_ms: 222 },
                Record { sensor: 9, value: 0xC, utc_ms: 333 },
            ]
        );
    }

    #[test]
    fn test_out_of_storage_without_spool() {
        let f = fixture(2, false);
        let engine = &f.engine;
        // 2 sectors x 6 TSD values fit; the 13th write needs a third sector.
        for i in 0..12u32 {
            engine.write_tsd(42, i).expect("write");
        }
        let err = engine.write_tsd(42, 99).expect_err("pool exhausted");
        assert!(matches!(err, Error::OutOfStorage));
        assert_eq!(engine.dropped(42).expect("dropped"), 1);
        // Stored data is intact.
        assert_eq!(engine.total_records(42).expect("total"), 12);
    }

    #[test]
    fn test_spill_and_disk_only_ack_path() {
        let f = fixture(4, true);
        let engine = &f.engine;

        // Fill the pool with sensor 7 (sources GW + HD).
        for i in 0..24u32 {
            engine.write_tsd(7, i).expect("write");
        }
        // Pool is now full (4 sectors); the next write spills the oldest
        // sectors to disk and succeeds.
        for i in 24..30u32 {
            engine.write_tsd(7, i).expect("write with spill");
        }
        assert_eq!(engine.total_records(7).expect("total"), 30);
        assert!(engine.sector_count(7).expect("count") < 6);

        // Disk-only read: pending start must be NONE.
        let records = engine.read_bulk(GW, 7, 6).expect("read");
        assert_eq!(records.len(), 6);
        let values: Vec<u32> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, (0..6).collect::<Vec<u32>>());
        let (start, _) = engine.pending_start(GW, 7).expect("pending start");
        assert!(start.is_none(), "disk-only pending keeps sector NONE");

        engine.erase_all_pending(GW, 7).expect("erase");
        assert_eq!(engine.total_records(7).expect("total"), 30 - 6);
    }

    #[test]
    fn test_disk_then_ram_read_preserves_order() {
        let f = fixture(4, true);
        let engine = &f.engine;

        for i in 0..30u32 {
            engine.write_tsd(42, i).expect("write");
        }
        // Everything is readable in write order regardless of tiering.
        let records = engine.read_bulk(GW, 42, 100).expect("read");
        assert_eq!(records.len(), 30);
        let values: Vec<u32> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, (0..30).collect::<Vec<u32>>());

        // NACK rewinds across both tiers.
        engine.revert_all_pending(GW, 42).expect("revert");
        let again = engine.read_bulk(GW, 42, 100).expect("read");
        assert_eq!(records, again);

        engine.erase_all_pending(GW, 42).expect("erase");
        assert_eq!(engine.total_records(42).expect("total"), 0);
    }

    #[test]
    fn test_flush_all_then_recover() {
        let dir = TempDir::new().expect("tempdir");
        let mut cfg = GatewayConfig::default()
            .with_sensor(SensorConfig::tsd(42, "rpm", 250, SourceMask::of(&[GW])))
            .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
        cfg.net.anchor_host = "probe.example.net".into();
        cfg.storage.pool_sectors = 16;
        cfg.storage.spool_dir = dir.path().to_path_buf();
        let clock: UtcClock = Arc::new(|| 1_700_000_000_000);

        {
            let hub = Arc::new(Hub::new());
            let pool = Arc::new(SectorPool::new(16, hub.clone()).expect("pool"));
            let engine =
                StorageEngine::with_clock(&cfg, pool, hub, clock.clone()).expect("engine");
            for i in 0..10u32 {
                engine.write_tsd(42, i).expect("write");
            }
            let flushed = engine.flush_all().expect("flush");
            assert!(flushed >= 2);
            assert_eq!(engine.sector_count(42).expect("count"), 0);
        }

        // Restart: recovery restores the disk backlog.
        let hub = Arc::new(Hub::new());
        let pool = Arc::new(SectorPool::new(16, hub.clone()).expect("pool"));
        let engine = StorageEngine::with_clock(&cfg, pool, hub, clock).expect("engine");
        engine.recover().expect("recover");
        assert_eq!(engine.total_records(42).expect("total"), 10);

        let records = engine.read_bulk(GW, 42, 100).expect("read");
        let values: Vec<u32> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_write_evt_with_gps_companions_share_stamp() {
        struct FixedGps;
        impl GpsProvider for FixedGps {
            fn current_fix(&self) -> Option<GpsFix> {
                Some(GpsFix {
                    latitude: 48.137,
                    longitude: 11.575,
                    altitude_m: 519.0,
                    speed_mps: 13.9,
                })
            }
        }

        let mask = SourceMask::of(&[GW]);
        let dir = TempDir::new().expect("tempdir");
        let mut cfg = GatewayConfig::default()
            .with_sensor(SensorConfig::evt(9, "impact", mask))
            .with_sensor(SensorConfig::evt(11, "gps_lat", mask))
            .with_sensor(SensorConfig::evt(12, "gps_lon", mask))
            .with_sensor(SensorConfig::evt(13, "gps_alt", mask))
            .with_sensor(SensorConfig::evt(14, "gps_speed", mask))
            .with_interface(IfaceConfig::new(IfaceKind::Ethernet, "eth0", 0));
        cfg.net.anchor_host = "probe.example.net".into();
        cfg.storage.pool_sectors = 32;
        cfg.storage.spool_dir = dir.path().to_path_buf();
        cfg.gps = Some(GpsSensors {
            latitude: 11,
            longitude: 12,
            altitude: 13,
            speed: 14,
        });
        cfg.validate().expect("valid");

        let hub = Arc::new(Hub::new());
        let pool = Arc::new(SectorPool::new(32, hub.clone()).expect("pool"));
        let engine = StorageEngine::new(&cfg, pool, hub).expect("engine");
        engine.register_gps_provider(Arc::new(FixedGps));

        engine.write_evt_with_gps(9, 1, 555_000).expect("write");

        for id in [9u16, 11, 12, 13, 14] {
            let records = engine.read_bulk(GW, id, 10).expect("read");
            assert_eq!(records.len(), 1, "sensor {} got its record", id);
            assert_eq!(records[0].utc_ms, 555_000, "sensor {} same stamp", id);
        }
        let lat = engine.read_bulk(GW, 11, 10).expect("read");
        assert!(lat.is_empty(), "second read returns nothing new");
    }

    #[test]
    fn test_unknown_sensor_rejected() {
        let f = fixture(8, false);
        assert!(matches!(
            f.engine.write_tsd(999, 1),
            Err(Error::SensorUnknown(999))
        ));
        assert!(matches!(
            f.engine.read_bulk(GW, 999, 10),
            Err(Error::SensorUnknown(999))
        ));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let f = fixture(8, false);
        assert!(f.engine.write_evt(42, 1, 0).is_err());
        assert!(f.engine.write_tsd(9, 1).is_err());
    }

    #[test]
    fn test_pending_lifecycle_events_published() {
        let f = fixture(32, false);
        let rx = f.hub.subscribe(256);
        let engine = &f.engine;

        for i in 0..6u32 {
            engine.write_tsd(42, i).expect("write");
        }
        engine.read_bulk(GW, 42, 100).expect("read");
        engine.erase_all_pending(GW, 42).expect("erase");

        let events: Vec<DiagEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, DiagEvent::PendingOpened { sensor: 42, count: 6, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, DiagEvent::SectorErased { sensor: 42, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, DiagEvent::ChainUnlinked { sensor: 42, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, DiagEvent::EraseDone { sensor: 42, erased: 6, .. })));
    }

    #[test]
    fn test_randomized_invariants_single_source() {
        let f = fixture(64, false);
        let engine = &f.engine;
        let total_sectors = engine.pool().total_sectors();
        fastrand::seed(0x5EED);

        let mut written = 0u64;
        let mut erased = 0u64;
        for _ in 0..500 {
            match fastrand::u8(0..4) {
                0 | 1 => {
                    if engine.write_tsd(42, fastrand::u32(..)).is_ok() {
                        written += 1;
                    }
                }
                2 => {
                    let n = engine.read_bulk(GW, 42, fastrand::usize(1..20)).expect("read");
                    let _ = n;
                }
                _ => {
                    if fastrand::bool() {
                        let pending =
                            u64::from(engine.pending_count(GW, 42).expect("count"));
                        engine.erase_all_pending(GW, 42).expect("erase");
                        erased += pending;
                    } else {
                        engine.revert_all_pending(GW, 42).expect("revert");
                    }
                }
            }

            // Invariant 1: counter algebra.
            assert_eq!(engine.total_records(42).expect("total"), written - erased);
            // Invariant 2: free + used-by-chains == total.
            let chains: u32 = [42u16, 7, 9]
                .iter()
                .map(|s| engine.sector_count(*s).expect("count"))
                .sum();
            assert_eq!(
                engine.pool().free_sectors() + chains as usize,
                total_sectors
            );
        }
    }
}
