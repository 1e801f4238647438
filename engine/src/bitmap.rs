// Copyright 2026 Oxide Computer Company
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/**
 * Write-intent tracking, in stripe-row space (per-disk sector offsets,
 * not logical sectors).  Before a stripe commits a write the covering
 * region is marked dirty; once the write-back completes it is marked
 * clean again.  A resync pass then only needs to visit rows whose
 * region was dirty when the engine last stopped.
 *
 * Granularity is the implementation's business: marking clean is purely
 * an optimization, so an implementation that is coarse about it (or
 * ignores it entirely) costs resync time, never correctness.
 */
pub trait WriteIntentBitmap: std::fmt::Debug + Send + Sync {
    fn mark_dirty_before_write(&self, stripe_sector: u64, sectors: u64);
    fn mark_clean_after_write(
        &self,
        stripe_sector: u64,
        sectors: u64,
        succeeded: bool,
    );

    /// Does the row at this offset need to be resynced?
    fn needs_resync(&self, stripe_sector: u64) -> bool;

    /// How many sectors from this offset are clean and can be skipped?
    /// Zero means the row at `stripe_sector` itself needs work.
    fn skip_count(&self, stripe_sector: u64) -> u64;

    /// Push accumulated dirty/clean transitions to backing storage.
    /// Called at barrier points: recovery checkpoints, pool quiesce,
    /// and engine shutdown.
    fn flush_pending(&self);
}

/// Region-granular bitmap held in memory.
#[derive(Debug)]
pub struct InMemoryBitmap {
    capacity: u64,
    region_sectors: u64,
    dirty: Mutex<BTreeSet<u64>>,
    flushes: AtomicU64,
}

impl InMemoryBitmap {
    pub fn new(capacity: u64, region_sectors: u64) -> InMemoryBitmap {
        assert!(region_sectors > 0 && capacity % region_sectors == 0);
        InMemoryBitmap {
            capacity,
            region_sectors,
            dirty: Mutex::new(BTreeSet::new()),
            flushes: AtomicU64::new(0),
        }
    }

    /// Barrier flushes observed, for tests; the in-memory map itself
    /// has nothing to persist.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Mark the whole device dirty, forcing a full resync pass.
    pub fn dirty_all(&self) {
        let mut dirty = self.dirty.lock().unwrap();
        for r in 0..self.capacity / self.region_sectors {
            dirty.insert(r);
        }
    }

    pub fn dirty_region_count(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    fn region(&self, sector: u64) -> u64 {
        sector / self.region_sectors
    }
}

impl WriteIntentBitmap for InMemoryBitmap {
    fn mark_dirty_before_write(&self, stripe_sector: u64, sectors: u64) {
        let mut dirty = self.dirty.lock().unwrap();
        let last = self.region(stripe_sector + sectors - 1);
        for r in self.region(stripe_sector)..=last {
            dirty.insert(r);
        }
    }

    fn mark_clean_after_write(
        &self,
        stripe_sector: u64,
        sectors: u64,
        succeeded: bool,
    ) {
        if !succeeded {
            // A failed write-back leaves the region dirty so the next
            // resync revisits it.
            return;
        }
        let mut dirty = self.dirty.lock().unwrap();
        let last = self.region(stripe_sector + sectors - 1);
        for r in self.region(stripe_sector)..=last {
            dirty.remove(&r);
        }
    }

    fn needs_resync(&self, stripe_sector: u64) -> bool {
        self.dirty
            .lock()
            .unwrap()
            .contains(&self.region(stripe_sector))
    }

    fn skip_count(&self, stripe_sector: u64) -> u64 {
        let dirty = self.dirty.lock().unwrap();
        let region = self.region(stripe_sector);
        if dirty.contains(&region) {
            return 0;
        }
        match dirty.range(region + 1..).next() {
            Some(&next) => next * self.region_sectors - stripe_sector,
            None => self.capacity.saturating_sub(stripe_sector),
        }
    }

    fn flush_pending(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dirty_then_clean() {
        let b = InMemoryBitmap::new(1024, 64);
        assert!(!b.needs_resync(0));

        b.mark_dirty_before_write(100, 16);
        assert!(b.needs_resync(64));
        assert!(b.needs_resync(112));
        assert!(!b.needs_resync(128));

        b.mark_clean_after_write(100, 16, true);
        assert!(!b.needs_resync(64));
    }

    #[test]
    fn test_failed_write_stays_dirty() {
        let b = InMemoryBitmap::new(1024, 64);
        b.mark_dirty_before_write(0, 8);
        b.mark_clean_after_write(0, 8, false);
        assert!(b.needs_resync(0));
    }

    #[test]
    fn test_skip_count_jumps_to_next_dirty() {
        let b = InMemoryBitmap::new(1024, 64);
        b.mark_dirty_before_write(512, 8);

        assert_eq!(b.skip_count(0), 512);
        assert_eq!(b.skip_count(100), 412);
        assert_eq!(b.skip_count(512), 0);
        // Past the only dirty region, skip runs to the end.
        assert_eq!(b.skip_count(576), 1024 - 576);
    }

    #[test]
    fn test_flush_is_counted_and_preserves_state() {
        let b = InMemoryBitmap::new(1024, 64);
        b.mark_dirty_before_write(0, 8);
        assert_eq!(b.flush_count(), 0);

        b.flush_pending();
        b.flush_pending();
        assert_eq!(b.flush_count(), 2);
        // Flushing changes nothing about what is dirty.
        assert!(b.needs_resync(0));
    }

    #[test]
    fn test_dirty_all() {
        let b = InMemoryBitmap::new(1024, 64);
        b.dirty_all();
        assert_eq!(b.dirty_region_count(), 16);
        assert_eq!(b.skip_count(0), 0);
    }
}
