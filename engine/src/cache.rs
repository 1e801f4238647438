// Copyright 2026 Oxide Computer Company
use std::collections::{HashMap, VecDeque};

use slog::{info, Logger};

use crate::stripe::Stripe;
use crate::StripeHandle;
use palisade_common::{geometry, ArrayDefinition};

/// Outcome of a stripe lookup/acquire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AcquireResult {
    Acquired(StripeHandle),
    /// Not resident and the caller asked not to instantiate, or the
    /// pool is not admitting new work.
    Miss,
    /// Every descriptor is referenced; the caller must wait for a
    /// release.
    Exhausted,
}

/// Admission state of the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PoolPhase {
    Active,
    /// Draining toward idle; no new acquisitions admitted.  Used to
    /// quiesce before a reshape resizes every descriptor.
    Quiescing,
}

/**
 * Fixed population of stripe descriptors plus the lookup index over
 * them.  Descriptors are allocated once and recycled through the free
 * list; the total never changes outside an explicit resize, so a walk
 * of free + referenced + queued always accounts for every one.
 */
#[derive(Debug)]
pub(crate) struct StripeCache {
    stripes: Vec<Stripe>,
    index: HashMap<(u64, u8), StripeHandle>,
    free: VecDeque<StripeHandle>,
    needs_handling: VecDeque<StripeHandle>,
    phase: PoolPhase,
    log: Logger,
}

impl StripeCache {
    pub fn new(capacity: usize, disks: usize, log: Logger) -> StripeCache {
        assert!(capacity > 0);
        StripeCache {
            stripes: (0..capacity).map(|_| {
                let mut s = Stripe::new(disks);
                s.in_free = true;
                s
            }).collect(),
            index: HashMap::new(),
            free: (0..capacity).map(StripeHandle).collect(),
            needs_handling: VecDeque::new(),
            phase: PoolPhase::Active,
            log,
        }
    }

    pub fn capacity(&self) -> usize {
        self.stripes.len()
    }

    pub fn get(&self, h: StripeHandle) -> &Stripe {
        &self.stripes[h.0]
    }

    pub fn get_mut(&mut self, h: StripeHandle) -> &mut Stripe {
        &mut self.stripes[h.0]
    }

    /// Mutable access to two distinct stripes at once, for page copies
    /// between a reshape source and destination.
    pub fn get_mut2(
        &mut self,
        a: StripeHandle,
        b: StripeHandle,
    ) -> (&mut Stripe, &mut Stripe) {
        assert_ne!(a.0, b.0);
        if a.0 < b.0 {
            let (lo, hi) = self.stripes.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.stripes.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub fn lookup(&self, sector: u64, epoch: u8) -> Option<StripeHandle> {
        self.index.get(&(sector, epoch)).copied()
    }

    /**
     * Find or instantiate the descriptor for the row at `stripe_sector`
     * under the requested geometry generation, taking a reference on
     * it.  `create` controls whether a miss may recycle a free
     * descriptor.
     */
    pub fn acquire(
        &mut self,
        def: &ArrayDefinition,
        stripe_sector: u64,
        previous: bool,
        create: bool,
    ) -> AcquireResult {
        let epoch = def.epoch_for(previous);
        if let Some(&h) = self.index.get(&(stripe_sector, epoch)) {
            let s = &mut self.stripes[h.0];
            s.refcount += 1;
            s.in_free = false;
            return AcquireResult::Acquired(h);
        }
        if !create || self.phase != PoolPhase::Active {
            return AcquireResult::Miss;
        }

        // Skip stale free entries: a descriptor re-referenced after
        // release stays in the deque but is no longer recyclable.
        let h = loop {
            match self.free.pop_front() {
                None => return AcquireResult::Exhausted,
                Some(h) if self.stripes[h.0].in_free => break h,
                Some(_) => continue,
            }
        };

        let chunk = def.chunk_sectors(previous);
        let layout =
            geometry::layout_stripe(def, stripe_sector / chunk, previous);

        let s = &mut self.stripes[h.0];
        self.index.remove(&(s.sector, s.epoch));
        s.in_free = false;
        s.reset_for(stripe_sector, epoch, layout);
        s.refcount = 1;
        self.index.insert((stripe_sector, epoch), h);
        AcquireResult::Acquired(h)
    }

    /**
     * Drop one reference.  The last release routes the descriptor back
     * to the free list, unless it still has work queued against it, in
     * which case it goes to the handling queue instead.
     */
    pub fn release(&mut self, h: StripeHandle) {
        let s = &mut self.stripes[h.0];
        assert!(s.refcount > 0);
        s.refcount -= 1;
        if s.refcount > 0 {
            return;
        }
        if s.has_pending_work() {
            self.enqueue_handling(h);
        } else {
            let s = &mut self.stripes[h.0];
            s.in_free = true;
            self.free.push_back(h);
        }
    }

    pub fn enqueue_handling(&mut self, h: StripeHandle) {
        let s = &mut self.stripes[h.0];
        if !s.queued {
            s.queued = true;
            self.needs_handling.push_back(h);
        }
    }

    /// Route an unreferenced, fully-settled descriptor back to the
    /// free list.  No-op if anything still holds or feeds it.
    pub fn retire_if_idle(&mut self, h: StripeHandle) {
        let s = &mut self.stripes[h.0];
        if s.refcount == 0
            && !s.in_free
            && !s.queued
            && !s.has_pending_work()
        {
            s.in_free = true;
            self.free.push_back(h);
        }
    }

    pub fn pop_handling(&mut self) -> Option<StripeHandle> {
        let h = self.needs_handling.pop_front()?;
        self.stripes[h.0].queued = false;
        Some(h)
    }

    pub fn set_phase(&mut self, phase: PoolPhase) {
        self.phase = phase;
    }

    #[cfg(test)]
    pub fn phase(&self) -> PoolPhase {
        self.phase
    }

    /// True once nothing references any stripe and no work is pending,
    /// so the pool can be restructured safely.
    pub fn quiesced(&self) -> bool {
        self.needs_handling.is_empty()
            && self
                .stripes
                .iter()
                .all(|s| s.refcount == 0 && !s.has_pending_work())
    }

    /**
     * Rebuild every descriptor for a new member count.  All cached
     * contents are discarded; the caller must have quiesced the pool
     * first.
     */
    pub fn resize(&mut self, disks: usize) {
        assert!(self.quiesced());
        info!(
            self.log,
            "restructuring stripe pool for {} member disks", disks
        );
        let capacity = self.stripes.len();
        self.stripes = (0..capacity).map(|_| {
            let mut s = Stripe::new(disks);
            s.in_free = true;
            s
        }).collect();
        self.index.clear();
        self.free = (0..capacity).map(StripeHandle).collect();
        self.phase = PoolPhase::Active;
    }

    /// (free, referenced, queued) — conservation check for tests.
    #[cfg(test)]
    pub fn census(&self) -> (usize, usize, usize) {
        let free = self.stripes.iter().filter(|s| s.in_free).count();
        let referenced =
            self.stripes.iter().filter(|s| s.refcount > 0).count();
        (free, referenced, self.needs_handling.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use palisade_common::{Algorithm, RaidLevel, STRIPE_SECTORS};

    fn def() -> ArrayDefinition {
        ArrayDefinition::new(
            RaidLevel::Raid5,
            4,
            64,
            Algorithm::LeftSymmetric,
            1 << 16,
        )
        .unwrap()
    }

    fn cache(capacity: usize) -> StripeCache {
        let log = palisade_common::build_logger();
        StripeCache::new(capacity, 4, log)
    }

    #[test]
    fn test_acquire_hit_shares_descriptor() {
        let d = def();
        let mut c = cache(4);

        let h1 = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        let h2 = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        assert_eq!(h1, h2);
        assert_eq!(c.get(h1).refcount, 2);
        assert_eq!(c.census(), (3, 1, 0));

        c.release(h1);
        c.release(h2);
        assert_eq!(c.census(), (4, 0, 0));
    }

    #[test]
    fn test_epoch_prevents_aliasing() {
        let mut d = def();
        let mut c = cache(4);

        let h_old = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        d.begin_reshape(5, 64, Algorithm::LeftSymmetric).unwrap();

        // Same sector, new epoch: a distinct descriptor.
        let h_new = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        assert_ne!(h_old, h_new);
        // The old generation is still reachable as `previous`.
        assert_eq!(
            c.acquire(&d, 0, true, false),
            AcquireResult::Acquired(h_old)
        );
    }

    #[test]
    fn test_exhaustion_and_miss() {
        let d = def();
        let mut c = cache(2);

        let _h1 = c.acquire(&d, 0, false, true);
        let _h2 = c.acquire(&d, STRIPE_SECTORS, false, true);
        assert_eq!(
            c.acquire(&d, 2 * STRIPE_SECTORS, false, true),
            AcquireResult::Exhausted
        );
        assert_eq!(
            c.acquire(&d, 3 * STRIPE_SECTORS, false, false),
            AcquireResult::Miss
        );
    }

    #[test]
    fn test_release_recycles_lru() {
        let d = def();
        let mut c = cache(2);

        let h1 = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        c.release(h1);

        // Still indexed: a re-acquire finds the same descriptor with
        // its cached contents.
        assert_eq!(
            c.acquire(&d, 0, false, false),
            AcquireResult::Acquired(h1)
        );
        c.release(h1);

        // Recycling for other rows eventually evicts it.
        let ha = c.acquire(&d, 8, false, true);
        let hb = c.acquire(&d, 16, false, true);
        assert!(matches!(ha, AcquireResult::Acquired(_)));
        assert!(matches!(hb, AcquireResult::Acquired(_)));
        assert_eq!(c.acquire(&d, 0, false, false), AcquireResult::Miss);
    }

    #[test]
    fn test_quiesce_blocks_admission() {
        let d = def();
        let mut c = cache(4);
        c.set_phase(PoolPhase::Quiescing);
        assert_eq!(c.acquire(&d, 0, false, true), AcquireResult::Miss);
        assert!(c.quiesced());

        c.resize(5);
        assert_eq!(c.phase(), PoolPhase::Active);
        assert!(matches!(
            c.acquire(&d, 0, false, true),
            AcquireResult::Acquired(_)
        ));
    }

    #[test]
    fn test_handling_queue_dedupes() {
        let d = def();
        let mut c = cache(4);
        let h = match c.acquire(&d, 0, false, true) {
            AcquireResult::Acquired(h) => h,
            r => panic!("{:?}", r),
        };
        c.enqueue_handling(h);
        c.enqueue_handling(h);
        assert_eq!(c.pop_handling(), Some(h));
        assert_eq!(c.pop_handling(), None);
        c.release(h);
    }
}
