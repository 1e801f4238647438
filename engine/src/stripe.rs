// Copyright 2026 Oxide Computer Company
use bytes::Bytes;

use crate::buffer::Page;
use crate::RequestId;
use palisade_common::StripeLayout;

/// How a partial-stripe write updates parity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WriteStrategy {
    /// Read old data and parity for the written slots, xor the old data
    /// back out of parity, then xor the new data in.
    ReadModifyWrite,
    /// Read every data slot not fully overwritten, then recompute
    /// parity from scratch over the whole row.
    ReconstructWrite,
}

/// Progress of the write pipeline for one stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WritePhase {
    Idle,
    /// Prereads issued; waiting for them to land.
    Prereading,
    /// Data drained into pages and parity recomputed; write-backs are
    /// in flight.
    WritingBack,
}

/// Progress of a parity check (resync/scrub) for one stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CheckPhase {
    Idle,
    /// Gathering every slot of the row.
    Filling,
    /// Mismatch found in repair mode; corrected parity write-back is in
    /// flight.
    Rewriting,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SlotFlags {
    /// A device transfer for this slot is in flight; the page must not
    /// be touched until it lands.
    pub locked: bool,
    /// The page holds the current on-disk (or newer, post-drain)
    /// contents.
    pub uptodate: bool,
    pub wants_read: bool,
    pub wants_write: bool,
    /// Contents must be reconstructed from the other slots.
    pub wants_compute: bool,
    /// The last read of this slot failed.
    pub read_error: bool,
    /// Failed read attempts against this slot's disk.
    pub retries: u8,
    /// Reconstructed after a read error; write the page back to repair
    /// the on-disk copy.
    pub rewrite: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct StripeFlags {
    /// Resync/scrub is walking this stripe.
    pub syncing: bool,
    /// Check only: report mismatches, do not correct them.
    pub check_only: bool,
    /// Reshape is using this stripe (as source or destination).
    pub expanding: bool,
    /// Parity verified (or corrected) against data.
    pub insync: bool,
    /// Write commit deferred because the preread budget was exhausted.
    pub delayed: bool,
    /// Prereads for a pending write count against the global budget.
    pub prereading: bool,
}

/**
 * One request fragment's interest in one slot: a byte range of the
 * page, stamped with a global arrival sequence so overlapping reads and
 * writes settle in submission order.
 */
#[derive(Debug)]
pub(crate) struct SlotRequest {
    pub req: RequestId,
    pub seq: u64,
    pub page_offset: usize,
    pub len: usize,

    /// Byte offset of this range within the whole caller request.
    pub req_offset: usize,

    /// Payload for writes; None for reads.
    pub data: Option<Bytes>,
}

impl SlotRequest {
    pub fn overlaps(&self, other: &SlotRequest) -> bool {
        self.page_offset < other.page_offset + other.len
            && other.page_offset < self.page_offset + self.len
    }
}

/// Per-member-disk state of a stripe: the page and the request ranges
/// parked against it.
#[derive(Debug)]
pub(crate) struct StripeSlot {
    pub page: Page,
    pub toread: Vec<SlotRequest>,
    pub towrite: Vec<SlotRequest>,
    /// Drained into the page, awaiting write-back completion.
    pub written: Vec<SlotRequest>,
    pub flags: SlotFlags,
}

impl StripeSlot {
    fn new() -> StripeSlot {
        StripeSlot {
            page: Page::new(),
            toread: Vec::new(),
            towrite: Vec::new(),
            written: Vec::new(),
            flags: SlotFlags::default(),
        }
    }

    fn reset(&mut self) {
        assert!(self.toread.is_empty());
        assert!(self.towrite.is_empty());
        assert!(self.written.is_empty());
        assert!(!self.flags.locked);
        self.flags = SlotFlags::default();
    }

    /// Insert keeping the list sorted by (page_offset, seq).  Drain and
    /// satisfaction walk entries by seq; the offset order makes range
    /// scans cheap.
    fn insert_sorted(list: &mut Vec<SlotRequest>, sr: SlotRequest) {
        let at = list
            .iter()
            .position(|e| (e.page_offset, e.seq) > (sr.page_offset, sr.seq))
            .unwrap_or(list.len());
        list.insert(at, sr);
    }

    pub fn attach_read(&mut self, sr: SlotRequest) {
        Self::insert_sorted(&mut self.toread, sr);
    }

    pub fn attach_write(&mut self, sr: SlotRequest) {
        Self::insert_sorted(&mut self.towrite, sr);
    }

    pub fn has_requests(&self) -> bool {
        !self.toread.is_empty()
            || !self.towrite.is_empty()
            || !self.written.is_empty()
    }

    /// Does any pending or in-flight write cover part of `sr`'s range
    /// with an earlier sequence number?  Such a read must not be
    /// satisfied from the old page contents.
    pub fn read_blocked_by_write(&self, sr: &SlotRequest) -> bool {
        self.towrite
            .iter()
            .chain(self.written.iter())
            .any(|w| w.seq < sr.seq && w.overlaps(sr))
    }
}

/**
 * One stripe descriptor: a page-height row across every member disk,
 * identified by (stripe_sector, epoch).  The epoch pins the descriptor
 * to one geometry generation so pre- and post-reshape rows at the same
 * offset never alias.
 *
 * A descriptor is only ever mutated by the engine task; refcount tracks
 * outside interest (attached fragments, recovery) and gates recycling.
 */
#[derive(Debug)]
pub(crate) struct Stripe {
    pub sector: u64,
    pub epoch: u8,
    pub refcount: usize,

    pub pd_idx: usize,
    pub qd_idx: Option<usize>,
    /// Syndrome order: data_slots[i] holds the row's i-th data block.
    pub data_slots: Vec<usize>,

    pub slots: Vec<StripeSlot>,
    pub flags: StripeFlags,
    pub write_phase: WritePhase,
    pub check_phase: CheckPhase,
    pub strategy: Option<WriteStrategy>,

    /// On the free list (recyclable).
    pub in_free: bool,
    /// On the needs-handling queue.
    pub queued: bool,
}

impl Stripe {
    pub fn new(disks: usize) -> Stripe {
        Stripe {
            sector: u64::MAX,
            epoch: 0,
            refcount: 0,
            pd_idx: 0,
            qd_idx: None,
            data_slots: Vec::new(),
            slots: (0..disks).map(|_| StripeSlot::new()).collect(),
            flags: StripeFlags::default(),
            write_phase: WritePhase::Idle,
            check_phase: CheckPhase::Idle,
            strategy: None,
            in_free: false,
            queued: false,
        }
    }

    /// Recycle this descriptor for a different row.  The caller must
    /// have verified the stripe is idle.
    pub fn reset_for(&mut self, sector: u64, epoch: u8, layout: StripeLayout) {
        assert_eq!(self.refcount, 0);
        assert_eq!(self.write_phase, WritePhase::Idle);
        assert_eq!(self.check_phase, CheckPhase::Idle);
        assert!(self.strategy.is_none());

        self.sector = sector;
        self.epoch = epoch;
        self.pd_idx = layout.pd_idx;
        self.qd_idx = layout.qd_idx;
        self.data_slots = layout.data_slots;
        self.flags = StripeFlags::default();
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
    }

    /// Anything left that a handling pass could make progress on?
    pub fn has_pending_work(&self) -> bool {
        self.write_phase != WritePhase::Idle
            || self.check_phase != CheckPhase::Idle
            || self.flags.syncing
            || self.flags.expanding
            || self.slots.iter().any(|s| {
                s.has_requests()
                    || s.flags.locked
                    || s.flags.wants_read
                    || s.flags.wants_write
                    || s.flags.wants_compute
            })
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use palisade_common::{
        Algorithm, ArrayDefinition, RaidLevel,
    };

    fn layout() -> StripeLayout {
        let def = ArrayDefinition::new(
            RaidLevel::Raid5,
            4,
            64,
            Algorithm::LeftSymmetric,
            4096,
        )
        .unwrap();
        palisade_common::geometry::layout_stripe(&def, 0, false)
    }

    fn sr(seq: u64, page_offset: usize, len: usize) -> SlotRequest {
        SlotRequest {
            req: RequestId(seq),
            seq,
            page_offset,
            len,
            req_offset: 0,
            data: None,
        }
    }

    #[test]
    fn test_overlap_detection() {
        assert!(sr(0, 0, 512).overlaps(&sr(1, 0, 512)));
        assert!(sr(0, 0, 1024).overlaps(&sr(1, 512, 512)));
        assert!(!sr(0, 0, 512).overlaps(&sr(1, 512, 512)));
        assert!(!sr(0, 1024, 512).overlaps(&sr(1, 0, 512)));
    }

    #[test]
    fn test_attach_keeps_offset_order() {
        let mut slot = StripeSlot::new();
        slot.attach_write(sr(0, 1024, 512));
        slot.attach_write(sr(1, 0, 512));
        slot.attach_write(sr(2, 1024, 512));

        let offsets: Vec<(usize, u64)> =
            slot.towrite.iter().map(|e| (e.page_offset, e.seq)).collect();
        assert_eq!(offsets, vec![(0, 1), (1024, 0), (1024, 2)]);
    }

    #[test]
    fn test_read_after_write_is_blocked() {
        let mut slot = StripeSlot::new();
        slot.attach_write(sr(0, 0, 1024));

        // A later read over the same range must wait for the write.
        assert!(slot.read_blocked_by_write(&sr(1, 512, 512)));
        // An earlier read (arrived before the write) is not.
        assert!(!slot.read_blocked_by_write(&sr(0, 512, 512)));
        // Disjoint ranges never block.
        assert!(!slot.read_blocked_by_write(&sr(5, 2048, 512)));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut s = Stripe::new(4);
        s.reset_for(128, 3, layout());
        assert_eq!(s.sector, 128);
        assert_eq!(s.epoch, 3);
        assert_eq!(s.data_slots.len(), 3);
        assert!(!s.has_pending_work());

        s.slots[0].attach_read(sr(0, 0, 512));
        assert!(s.has_pending_work());
    }

    #[test]
    #[should_panic]
    fn test_reset_with_requests_panics() {
        let mut s = Stripe::new(4);
        s.reset_for(0, 0, layout());
        s.slots[1].attach_write(sr(0, 0, 512));
        s.reset_for(8, 0, layout());
    }
}
