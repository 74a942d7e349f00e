// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity sector pool with free-list allocation and threshold
//! crossing reports.
//!
//! Sectors are uniform, so the pool never fragments the allocation unit;
//! only the free list's ordering is arbitrary after churn. A single mutex
//! guards the free list, the counters, and the sector array. Lock order when
//! a sensor chain is also involved: sensor lock first, pool lock second,
//! never the reverse.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::diag::{DiagEvent, Hub};
use crate::error::{Error, Result};
use crate::storage::sector::{RawSectorId, Sector, SectorId, SectorKind};

struct PoolInner {
    sectors: Vec<Sector>,
    free_list: Vec<SectorId>,
    free_sectors: usize,
    total_sectors: usize,
    /// Last reported 10% usage bucket; `None` forces a full replay from 10%
    /// up on the next report (first report, or first observer attach).
    last_reported: Option<u8>,
    had_observer: bool,
}

/// Bounded pool of fixed-size sectors.
pub struct SectorPool {
    inner: Mutex<PoolInner>,
    hub: Arc<Hub>,
}

impl SectorPool {
    /// Create a pool of `total` sectors reporting to `hub`.
    pub fn new(total: usize, hub: Arc<Hub>) -> Result<Self> {
        if total == 0 {
            return Err(Error::ConfigInvalid("pool size must be non-zero".into()));
        }
        // The all-ones raw value is the NONE sentinel and must stay unused.
        if total >= RawSectorId::MAX as usize {
            return Err(Error::ConfigInvalid(format!(
                "pool size {} exceeds sector id width (max {})",
                total,
                RawSectorId::MAX as usize - 1
            )));
        }

        let sectors = vec![Sector::unallocated(); total];
        // Reverse push so the first allocation pops sector 0.
        let free_list: Vec<SectorId> = (0..total)
            .rev()
            .map(|i| SectorId::from_index(i).expect("index below sentinel"))
            .collect();

        Ok(Self {
            inner: Mutex::new(PoolInner {
                sectors,
                free_list,
                free_sectors: total,
                total_sectors: total,
                last_reported: None,
                had_observer: false,
            }),
            hub,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("[SectorPool] lock poisoned, recovering");
                e.into_inner()
            }
        }
    }

    /// Allocate one sector for `kind`, or `PoolFull`.
    ///
    /// The caller (storage engine) reacts to `PoolFull` by running a
    /// spillover pass and retrying once.
    pub fn allocate(&self, kind: SectorKind) -> Result<SectorId> {
        let mut inner = self.lock();
        let Some(id) = inner.free_list.pop() else {
            return Err(Error::PoolFull);
        };
        inner.sectors[id.index()].reset(kind);
        inner.free_sectors -= 1;
        self.check_threshold(&mut inner);
        Ok(id)
    }

    /// Return a sector to the free list.
    ///
    /// Freeing a sector that is not allocated is a programming error and
    /// fails loudly.
    pub fn free(&self, id: SectorId) {
        let mut inner = self.lock();
        let index = id.index();
        assert!(index < inner.total_sectors, "free of out-of-range sector {}", id);
        if !inner.sectors[index].is_allocated() {
            log::error!("[SectorPool::free] double free of sector {}", id);
            panic!("double free of sector {}", id);
        }
        inner.sectors[index].mark_free();
        inner.free_list.push(id);
        inner.free_sectors += 1;
        self.check_threshold(&mut inner);
    }

    /// Successor link stored in the sector header.
    pub fn next_in_chain(&self, id: SectorId) -> Result<SectorId> {
        let inner = self.lock();
        Ok(checked(&inner, id)?.next())
    }

    /// Write the successor link.
    pub fn set_next_in_chain(&self, id: SectorId, next: SectorId) -> Result<()> {
        let mut inner = self.lock();
        checked_mut(&mut inner, id)?.set_next(next);
        Ok(())
    }

    /// True when every record slot in the sector has been erased.
    pub fn is_completely_empty(&self, id: SectorId) -> Result<bool> {
        let inner = self.lock();
        Ok(checked(&inner, id)?.is_completely_empty())
    }

    /// Read access to an allocated sector.
    pub fn with_sector<T>(&self, id: SectorId, f: impl FnOnce(&Sector) -> T) -> Result<T> {
        let inner = self.lock();
        Ok(f(checked(&inner, id)?))
    }

    /// Write access to an allocated sector. The owning sensor's lock must be
    /// held by the caller; the pool lock only covers the array access.
    pub fn with_sector_mut<T>(&self, id: SectorId, f: impl FnOnce(&mut Sector) -> T) -> Result<T> {
        let mut inner = self.lock();
        Ok(f(checked_mut(&mut inner, id)?))
    }

    /// Free sector count.
    pub fn free_sectors(&self) -> usize {
        self.lock().free_sectors
    }

    /// Total sector count.
    pub fn total_sectors(&self) -> usize {
        self.lock().total_sectors
    }

    /// Pool usage in whole percent.
    pub fn usage_percent(&self) -> u8 {
        let inner = self.lock();
        usage_percent(&inner)
    }

    /// Emit threshold crossings against the last reported bucket.
    ///
    /// The first report after the first hub subscriber attaches replays one
    /// event per 10% step from 10 up to the current bucket, so a late
    /// observer still learns the standing usage.
    fn check_threshold(&self, inner: &mut PoolInner) {
        let observed = self.hub.subscriber_count() > 0;
        if observed && !inner.had_observer {
            inner.had_observer = true;
            inner.last_reported = None;
        }

        let usage = usage_percent(inner);
        let bucket = usage / 10 * 10;

        match inner.last_reported {
            None => {
                let mut t = 10;
                while t <= bucket {
                    self.publish_threshold(t, usage);
                    t += 10;
                }
            }
            Some(last) if bucket > last => {
                let mut t = last + 10;
                while t <= bucket {
                    self.publish_threshold(t, usage);
                    t += 10;
                }
            }
            Some(last) if bucket < last => {
                let mut t = last;
                while t > bucket {
                    self.publish_threshold(t, usage);
                    t -= 10;
                }
            }
            Some(_) => {}
        }
        inner.last_reported = Some(bucket);
    }

    fn publish_threshold(&self, threshold_pct: u8, usage_pct: u8) {
        self.hub.publish(&DiagEvent::PoolThreshold {
            threshold_pct,
            usage_pct,
        });
        crate::diag_debug!(
            crate::diag::DBG_STORAGE,
            "[SectorPool] usage crossed {}% (now {}%)",
            threshold_pct,
            usage_pct
        );
    }
}

fn usage_percent(inner: &PoolInner) -> u8 {
    let used = inner.total_sectors - inner.free_sectors;
    ((used * 100) / inner.total_sectors) as u8
}

fn checked<'a>(inner: &'a PoolInner, id: SectorId) -> Result<&'a Sector> {
    if id.is_none() || id.index() >= inner.total_sectors {
        return Err(Error::invalid_sector(id));
    }
    let sector = &inner.sectors[id.index()];
    if !sector.is_allocated() {
        return Err(Error::invalid_sector(id));
    }
    Ok(sector)
}

fn checked_mut<'a>(inner: &'a mut PoolInner, id: SectorId) -> Result<&'a mut Sector> {
    if id.is_none() || id.index() >= inner.total_sectors {
        return Err(Error::invalid_sector(id));
    }
    let sector = &mut inner.sectors[id.index()];
    if !sector.is_allocated() {
        return Err(Error::invalid_sector(id));
    }
    Ok(sector)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagEvent;

    fn pool(total: usize) -> (SectorPool, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        let pool = SectorPool::new(total, hub.clone()).expect("pool");
        (pool, hub)
    }

    #[test]
    fn test_allocate_free_roundtrip() {
        let (pool, _hub) = pool(4);
        assert_eq!(pool.free_sectors(), 4);

        let a = pool.allocate(SectorKind::Tsd).expect("alloc");
        let b = pool.allocate(SectorKind::Evt).expect("alloc");
        assert_eq!(pool.free_sectors(), 2);
        assert_ne!(a, b);

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_sectors(), 4);
    }

    #[test]
    fn test_pool_full() {
        let (pool, _hub) = pool(2);
        pool.allocate(SectorKind::Tsd).expect("alloc");
        pool.allocate(SectorKind::Tsd).expect("alloc");
        assert!(matches!(
            pool.allocate(SectorKind::Tsd),
            Err(Error::PoolFull)
        ));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let (pool, _hub) = pool(2);
        let a = pool.allocate(SectorKind::Tsd).expect("alloc");
        pool.free(a);
        pool.free(a);
    }

    #[test]
    fn test_chain_links() {
        let (pool, _hub) = pool(4);
        let a = pool.allocate(SectorKind::Tsd).expect("alloc");
        let b = pool.allocate(SectorKind::Tsd).expect("alloc");

        assert!(pool.next_in_chain(a).expect("next").is_none());
        pool.set_next_in_chain(a, b).expect("link");
        assert_eq!(pool.next_in_chain(a).expect("next"), b);
    }

    #[test]
    fn test_freed_sector_rejected_by_accessors() {
        let (pool, _hub) = pool(2);
        let a = pool.allocate(SectorKind::Tsd).expect("alloc");
        pool.free(a);
        assert!(matches!(
            pool.next_in_chain(a),
            Err(Error::InvalidSector(_))
        ));
    }

    #[test]
    fn test_threshold_events_ascending() {
        let (pool, hub) = pool(10);
        let rx = hub.subscribe(64);

        // 0% -> 30%: expect events for 10, 20, 30.
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.allocate(SectorKind::Tsd).expect("alloc"));
        }

        let thresholds: Vec<u8> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
                _ => None,
            })
            .collect();
        assert_eq!(thresholds, vec![10, 20, 30]);
    }

    #[test]
    fn test_threshold_events_descending() {
        let (pool, hub) = pool(10);
        let rx = hub.subscribe(64);

        let held: Vec<_> = (0..5)
            .map(|_| pool.allocate(SectorKind::Tsd).expect("alloc"))
            .collect();
        let _ = rx.try_iter().count(); // drain the ascent

        for id in held {
            pool.free(id);
        }

        let thresholds: Vec<u8> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
                _ => None,
            })
            .collect();
        assert_eq!(thresholds, vec![50, 40, 30, 20, 10]);
    }

    #[test]
    fn test_threshold_replay_on_late_attach() {
        let (pool, hub) = pool(200);

        // Pre-fill to 49% with nobody listening.
        let mut held = Vec::new();
        for _ in 0..98 {
            held.push(pool.allocate(SectorKind::Tsd).expect("alloc"));
        }

        // First observer attaches late; the next allocation must replay
        // 10..=40 before reporting anything newer.
        let rx = hub.subscribe(64);
        held.push(pool.allocate(SectorKind::Tsd).expect("alloc")); // 49.5%

        let thresholds: Vec<u8> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
                _ => None,
            })
            .collect();
        assert_eq!(thresholds, vec![10, 20, 30, 40]);

        // Crossing 50% afterwards yields exactly one more event.
        held.push(pool.allocate(SectorKind::Tsd).expect("alloc")); // 50%
        let thresholds: Vec<u8> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                DiagEvent::PoolThreshold { threshold_pct, .. } => Some(threshold_pct),
                _ => None,
            })
            .collect();
        assert_eq!(thresholds, vec![50]);
    }

    #[test]
    fn test_pool_rejects_zero_size() {
        let hub = Arc::new(Hub::new());
        assert!(SectorPool::new(0, hub).is_err());
    }
}
