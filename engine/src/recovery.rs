// Copyright 2026 Oxide Computer Company
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};

use crate::cache::{AcquireResult, PoolPhase};
use crate::disk::DiskEndpoint;
use crate::engine::RaidEngine;
use crate::parity;
use crate::stripe::WritePhase;
use crate::StripeHandle;
use palisade_common::{
    geometry, page_align_sector, raid_bail, read_json_maybe, write_json,
    Algorithm, RaidError, PAGE_SIZE, STRIPE_SECTORS,
};

/// Rows verified between checkpoint writes during a resync.
const RESYNC_CHECKPOINT_ROWS: u64 = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RepairMode {
    /// Verify parity and count mismatches; change nothing.
    Check,
    /// Verify parity and rewrite redundancy that does not match.
    Repair,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    Resync,
    Reshape,
}

/**
 * Durable record of recovery progress.  Everything at or past `cursor`
 * has not been processed; a restart resumes there rather than starting
 * over.  The epoch ties the record to one geometry generation — a
 * checkpoint from a different generation is meaningless and ignored.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub kind: CheckpointKind,
    pub cursor: u64,
    pub epoch: u8,
}

/// Persists recovery checkpoints.  `save` must be durable before it
/// returns: the reshape cursor only advances after the save succeeds.
pub trait ProgressStore: std::fmt::Debug + Send {
    fn save(&mut self, cp: &RecoveryCheckpoint) -> Result<(), RaidError>;
    fn load(&self) -> Result<Option<RecoveryCheckpoint>, RaidError>;
}

/// Checkpoints as a JSON file, written via rename so a torn record is
/// never observed.
#[derive(Debug)]
pub struct JsonProgressStore {
    path: PathBuf,
}

impl JsonProgressStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> JsonProgressStore {
        JsonProgressStore { path: path.into() }
    }
}

impl ProgressStore for JsonProgressStore {
    fn save(&mut self, cp: &RecoveryCheckpoint) -> Result<(), RaidError> {
        write_json(&self.path, cp, true)
    }

    fn load(&self) -> Result<Option<RecoveryCheckpoint>, RaidError> {
        read_json_maybe(&self.path)
    }
}

#[derive(Debug)]
struct ResyncState {
    /// Next stripe-row offset to examine (per-disk sectors).
    cursor: u64,
    mode: RepairMode,
    active: Option<StripeHandle>,
    since_checkpoint: u64,

    /// Start of the contiguous run of rows verified so far; the bitmap
    /// is marked clean a whole run at a time, when the run ends, so a
    /// partially-verified region is never cleared.
    clean_from: Option<u64>,
}

#[derive(Debug)]
struct PendingReshape {
    added: Vec<Arc<dyn DiskEndpoint>>,
    chunk_sectors: u64,
    algorithm: Algorithm,
}

/// One source page feeding one destination slot of the reshape window.
#[derive(Debug)]
struct Fetch {
    src: StripeHandle,
    src_slot: usize,
    dest: StripeHandle,
    dest_slot: usize,
    done: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum ReshapePhase {
    Fetching,
    Writing,
}

#[derive(Debug)]
struct ReshapeState {
    /// Next destination chunk-row (new geometry) to populate.
    dest_stripe: u64,
    phase: ReshapePhase,
    fetches: Vec<Fetch>,
    dests: Vec<StripeHandle>,
}

#[derive(Debug)]
enum RecoveryState {
    Idle,
    Resync(ResyncState),
    /// Reshape requested; waiting for the stripe pool to drain so it
    /// can be restructured for the new member count.
    AwaitQuiesce(PendingReshape),
    Reshape(ReshapeState),
    /// A checkpoint could not be persisted; recovery halts rather than
    /// risk advancing past an unrecorded position.
    Stalled,
}

/**
 * The background recovery walker.  At most one operation runs at a
 * time; it is driven by `recovery_tick` calls from the engine task, one
 * small step each, so caller I/O interleaves freely.
 */
#[derive(Debug)]
pub(crate) struct RecoveryDriver {
    state: RecoveryState,
    store: Option<Box<dyn ProgressStore>>,

    /// Logical range the reshape is actively relocating; caller I/O
    /// that overlaps it parks until the window moves on.
    window: Option<(u64, u64)>,

    /// Set when the array degrades past its redundancy; the next tick
    /// abandons whatever was running.
    array_failed: bool,
    log: Logger,
}

impl RecoveryDriver {
    pub fn new(
        store: Option<Box<dyn ProgressStore>>,
        log: Logger,
    ) -> RecoveryDriver {
        RecoveryDriver {
            state: RecoveryState::Idle,
            store,
            window: None,
            array_failed: false,
            log,
        }
    }

    pub fn blocks_logical(&self, logical: u64, sectors: u64) -> bool {
        match self.window {
            None => false,
            Some((s, e)) => logical < e && s < logical + sectors,
        }
    }

    pub fn note_array_failed(&mut self) {
        self.array_failed = true;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, RecoveryState::Idle)
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self.state, RecoveryState::Stalled)
    }
}

impl RaidEngine {
    fn save_checkpoint(
        &mut self,
        kind: CheckpointKind,
        cursor: u64,
    ) -> Result<(), RaidError> {
        // The bitmap must be at least as current as the checkpoint, or
        // a restart could skip rows the record says are done.
        self.bitmap.flush_pending();
        let epoch = self.cfg.epoch();
        match &mut self.recovery.store {
            Some(store) => store.save(&RecoveryCheckpoint {
                kind,
                cursor,
                epoch,
            }),
            None => Ok(()),
        }
    }

    fn load_checkpoint(
        &self,
        kind: CheckpointKind,
    ) -> Option<RecoveryCheckpoint> {
        let cp = self.recovery.store.as_ref()?.load().ok()??;
        if cp.kind == kind && cp.epoch == self.cfg.epoch() {
            Some(cp)
        } else {
            None
        }
    }

    /**
     * Begin a resync pass over the whole array (or the dirty regions of
     * it, if the write-intent bitmap has been tracking).  Rejected when
     * another operation is running or a member is missing — a degraded
     * row has nothing to verify.
     */
    pub fn start_resync(&mut self, mode: RepairMode) -> Result<(), RaidError> {
        if !self.recovery.is_idle() {
            raid_bail!(
                ConflictingOperation,
                "recovery is already running ({:?})",
                self.recovery.state
            );
        }
        if self.failed_disks() > 0 {
            raid_bail!(
                NotEnoughDevices,
                "{} members failed; parity cannot be verified",
                self.failed_disks()
            );
        }
        let cursor = self
            .load_checkpoint(CheckpointKind::Resync)
            .map(|cp| cp.cursor)
            .unwrap_or(0);
        info!(
            self.log,
            "starting {:?} resync at row {}", mode, cursor
        );
        self.recovery.state = RecoveryState::Resync(ResyncState {
            cursor,
            mode,
            active: None,
            since_checkpoint: 0,
            clean_from: None,
        });
        Ok(())
    }

    /**
     * Begin growing the array onto `added` disks with a new chunk size
     * and rotation.  The pool first quiesces so it can be restructured;
     * relocation then proceeds window by window, each one checkpointed
     * before the cursor moves.
     */
    pub fn start_reshape(
        &mut self,
        added: Vec<Arc<dyn DiskEndpoint>>,
        chunk_sectors: u64,
        algorithm: Algorithm,
    ) -> Result<(), RaidError> {
        if !self.recovery.is_idle() {
            raid_bail!(
                ConflictingOperation,
                "recovery is already running ({:?})",
                self.recovery.state
            );
        }
        if self.cfg.reshape_active() {
            raid_bail!(ConflictingOperation, "reshape already in progress");
        }
        if self.failed_disks() > 0 {
            raid_bail!(
                NotEnoughDevices,
                "cannot reshape with {} failed members",
                self.failed_disks()
            );
        }
        for (i, d) in added.iter().enumerate() {
            if d.sector_count() < self.cfg.disk_sectors() {
                return Err(RaidError::InvalidDefinition(format!(
                    "added disk {} holds {} sectors, needs {}",
                    i,
                    d.sector_count(),
                    self.cfg.disk_sectors()
                )));
            }
        }
        // Validate the target geometry up front; the actual switch
        // happens once the pool has drained.
        let mut trial = (*self.cfg).clone();
        trial.begin_reshape(
            self.disks.len() + added.len(),
            chunk_sectors,
            algorithm,
        )?;

        info!(
            self.log,
            "reshape to {} disks requested; quiescing stripe pool",
            self.disks.len() + added.len()
        );
        self.cache.set_phase(PoolPhase::Quiescing);
        self.recovery.state = RecoveryState::AwaitQuiesce(PendingReshape {
            added,
            chunk_sectors,
            algorithm,
        });
        Ok(())
    }

    /// Resume whatever the persisted state says was interrupted.  Called
    /// once at startup.
    pub fn resume_recovery(&mut self) {
        if !self.cfg.reshape_active() {
            return;
        }
        let cfg = self.cfg.clone();
        let span = cfg.data_disks(false) as u64 * cfg.chunk_sectors(false);
        let position = self
            .load_checkpoint(CheckpointKind::Reshape)
            .map(|cp| cp.cursor)
            .unwrap_or_else(|| cfg.reshape_position().unwrap_or(0));
        info!(
            self.log,
            "resuming interrupted reshape at logical sector {}", position
        );
        self.recovery.state = RecoveryState::Reshape(ReshapeState {
            dest_stripe: position / span,
            phase: ReshapePhase::Fetching,
            fetches: Vec::new(),
            dests: Vec::new(),
        });
    }

    /// Advance the running recovery operation by one small step.
    pub fn recovery_tick(&mut self) {
        if self.recovery.array_failed {
            self.recovery.array_failed = false;
            self.abort_recovery();
            return;
        }
        let state =
            std::mem::replace(&mut self.recovery.state, RecoveryState::Idle);
        self.recovery.state = match state {
            RecoveryState::Idle => RecoveryState::Idle,
            RecoveryState::Stalled => RecoveryState::Stalled,
            RecoveryState::Resync(st) => self.tick_resync(st),
            RecoveryState::AwaitQuiesce(p) => self.tick_quiesce(p),
            RecoveryState::Reshape(st) => self.tick_reshape(st),
        };
    }

    fn abort_recovery(&mut self) {
        let state =
            std::mem::replace(&mut self.recovery.state, RecoveryState::Idle);
        error!(self.log, "aborting recovery: array has failed");
        match state {
            RecoveryState::Idle | RecoveryState::Stalled => {}
            RecoveryState::Resync(st) => {
                if let Some(h) = st.active {
                    let stripe = self.cache.get_mut(h);
                    stripe.flags.syncing = false;
                    if stripe.has_pending_work() {
                        self.cache.enqueue_handling(h);
                    }
                    self.cache.release(h);
                }
            }
            RecoveryState::AwaitQuiesce(_) => {
                self.cache.set_phase(PoolPhase::Active);
            }
            RecoveryState::Reshape(st) => {
                for f in st.fetches {
                    let src = self.cache.get_mut(f.src);
                    src.flags.expanding = false;
                    if src.has_pending_work() {
                        self.cache.enqueue_handling(f.src);
                    }
                    self.cache.release(f.src);
                }
                for h in st.dests {
                    let dest = self.cache.get_mut(h);
                    dest.flags.expanding = false;
                    if dest.has_pending_work() {
                        self.cache.enqueue_handling(h);
                    }
                    self.cache.release(h);
                }
            }
        }
        self.recovery.window = None;
    }

    fn tick_resync(&mut self, mut st: ResyncState) -> RecoveryState {
        let cfg = self.cfg.clone();

        if let Some(h) = st.active {
            let stripe = self.cache.get_mut(h);
            if !stripe.flags.insync {
                // Still gathering or rewriting.
                return RecoveryState::Resync(st);
            }
            stripe.flags.syncing = false;
            stripe.flags.insync = false;
            let sector = stripe.sector;
            // Caller writes attached while the row was syncing were held
            // off; wake the row so they get evaluated.
            if stripe.has_pending_work() {
                self.cache.enqueue_handling(h);
            }
            self.cache.release(h);
            st.active = None;

            if st.clean_from.is_none() {
                st.clean_from = Some(sector);
            }
            st.cursor = sector + STRIPE_SECTORS;
            st.since_checkpoint += 1;
            if st.since_checkpoint >= RESYNC_CHECKPOINT_ROWS {
                st.since_checkpoint = 0;
                if let Err(e) =
                    self.save_checkpoint(CheckpointKind::Resync, st.cursor)
                {
                    error!(self.log, "resync checkpoint failed: {}", e);
                    return RecoveryState::Stalled;
                }
            }
        }

        // Skip rows the bitmap knows are clean.
        let end = cfg.disk_sectors();
        loop {
            if st.cursor >= end {
                self.flush_clean_run(&mut st);
                info!(
                    self.log,
                    "resync complete ({} mismatches found)",
                    self.stats.mismatches
                );
                if let Err(e) =
                    self.save_checkpoint(CheckpointKind::Resync, end)
                {
                    error!(self.log, "final resync checkpoint failed: {}", e);
                }
                return RecoveryState::Idle;
            }
            let skip = self.bitmap.skip_count(st.cursor);
            if skip == 0 {
                break;
            }
            self.flush_clean_run(&mut st);
            st.cursor =
                page_align_sector(st.cursor + skip.max(STRIPE_SECTORS));
        }

        match self.cache.acquire(&cfg, st.cursor, false, true) {
            AcquireResult::Acquired(h) => {
                let stripe = self.cache.get_mut(h);
                stripe.flags.syncing = true;
                stripe.flags.check_only = st.mode == RepairMode::Check;
                stripe.flags.insync = false;
                st.active = Some(h);
                self.cache.enqueue_handling(h);
            }
            // Pool busy; try again next tick.
            AcquireResult::Miss | AcquireResult::Exhausted => {}
        }
        RecoveryState::Resync(st)
    }

    /// Mark the finished run of verified rows clean in the bitmap.
    /// Check mode leaves regions dirty so a later repair revisits them.
    fn flush_clean_run(&mut self, st: &mut ResyncState) {
        if let Some(from) = st.clean_from.take() {
            if st.mode == RepairMode::Repair && st.cursor > from {
                self.bitmap.mark_clean_after_write(
                    from,
                    st.cursor - from,
                    true,
                );
            }
        }
    }

    fn tick_quiesce(&mut self, p: PendingReshape) -> RecoveryState {
        if !self.cache.quiesced() {
            return RecoveryState::AwaitQuiesce(p);
        }

        let mut def = (*self.cfg).clone();
        if let Err(e) = def.begin_reshape(
            self.disks.len() + p.added.len(),
            p.chunk_sectors,
            p.algorithm,
        ) {
            // Validated at submission; only a conflicting change since
            // then can land here.
            error!(self.log, "reshape no longer valid: {}", e);
            self.cache.set_phase(PoolPhase::Active);
            return RecoveryState::Idle;
        }

        for d in p.added {
            self.disks.push(Some(d));
            self.disk_errors.push(0);
        }
        self.bitmap.flush_pending();
        self.cache.resize(self.disks.len());
        self.cfg = Arc::new(def);

        if let Err(e) = self.save_checkpoint(CheckpointKind::Reshape, 0) {
            error!(self.log, "initial reshape checkpoint failed: {}", e);
            return RecoveryState::Stalled;
        }
        info!(
            self.log,
            "pool quiesced; relocating onto {} members",
            self.disks.len()
        );
        RecoveryState::Reshape(ReshapeState {
            dest_stripe: 0,
            phase: ReshapePhase::Fetching,
            fetches: Vec::new(),
            dests: Vec::new(),
        })
    }

    fn tick_reshape(&mut self, mut st: ReshapeState) -> RecoveryState {
        let cfg = self.cfg.clone();
        let span =
            cfg.data_disks(false) as u64 * cfg.chunk_sectors(false);
        let total = cfg.capacity_sectors();
        let base = st.dest_stripe * span;

        match st.phase {
            ReshapePhase::Fetching => {
                if st.dests.is_empty() {
                    if base >= total {
                        return self.finish_reshape(total);
                    }
                    if !self.open_reshape_window(&mut st, base, total) {
                        // Sources or destinations busy; retry.
                        return RecoveryState::Reshape(st);
                    }
                }

                // Copy every source page that has landed.
                let mut all_done = true;
                for fi in 0..st.fetches.len() {
                    let f = &st.fetches[fi];
                    if f.done {
                        continue;
                    }
                    let src_up = self
                        .cache
                        .get(f.src)
                        .slots[f.src_slot]
                        .flags
                        .uptodate;
                    if !src_up {
                        all_done = false;
                        continue;
                    }
                    let (src_slot, dest, dest_slot) =
                        (f.src_slot, f.dest, f.dest_slot);
                    let (s, d) = self.cache.get_mut2(st.fetches[fi].src, dest);
                    let mut buf = vec![0u8; PAGE_SIZE];
                    s.slots[src_slot].page.copy_out(0, &mut buf);
                    d.slots[dest_slot].page.copy_in(0, &buf);
                    d.slots[dest_slot].flags.uptodate = true;
                    st.fetches[fi].done = true;
                }
                if !all_done {
                    return RecoveryState::Reshape(st);
                }

                for f in st.fetches.drain(..) {
                    let src = self.cache.get_mut(f.src);
                    src.flags.expanding = false;
                    // Caller writes held off by the fetch resume here.
                    if src.has_pending_work() {
                        self.cache.enqueue_handling(f.src);
                    }
                    self.cache.release(f.src);
                }
                for i in 0..st.dests.len() {
                    self.commit_full_row(st.dests[i]);
                }
                st.phase = ReshapePhase::Writing;
                RecoveryState::Reshape(st)
            }
            ReshapePhase::Writing => {
                let settled = st.dests.iter().all(|&h| {
                    self.cache.get(h).write_phase == WritePhase::Idle
                });
                if !settled {
                    return RecoveryState::Reshape(st);
                }

                let next = (base + span).min(total);
                if let Err(e) =
                    self.save_checkpoint(CheckpointKind::Reshape, next)
                {
                    // The destination holds the data but the cursor is
                    // not durable; halting here keeps the window
                    // blocked so nothing reads through stale mapping.
                    error!(self.log, "reshape checkpoint failed: {}", e);
                    return RecoveryState::Stalled;
                }
                let mut def = (*self.cfg).clone();
                def.advance_reshape(next);
                self.cfg = Arc::new(def);

                for h in st.dests.drain(..) {
                    self.cache.get_mut(h).flags.expanding = false;
                    self.cache.release(h);
                }
                self.recovery.window = None;
                st.dest_stripe += 1;
                st.phase = ReshapePhase::Fetching;
                RecoveryState::Reshape(st)
            }
        }
    }

    /**
     * Acquire the destination rows of one reshape window and the source
     * rows feeding them, scheduling reads for source pages not already
     * cached.  False if any piece was unavailable (pool pressure, or a
     * source still draining caller writes); everything is rolled back
     * and the window retried on a later tick.
     */
    fn open_reshape_window(
        &mut self,
        st: &mut ReshapeState,
        base: u64,
        total: u64,
    ) -> bool {
        let cfg = self.cfg.clone();
        let chunk = cfg.chunk_sectors(false);
        let row_base = st.dest_stripe * chunk;
        let span = chunk * cfg.data_disks(false) as u64;
        self.recovery.window = Some((base, (base + span).min(total)));

        let mut ok = true;
        let mut rows = Vec::new();
        for r in 0..chunk / STRIPE_SECTORS {
            let row_sector = row_base + r * STRIPE_SECTORS;
            match self.cache.acquire(&cfg, row_sector, false, true) {
                AcquireResult::Acquired(h) => {
                    self.cache.get_mut(h).flags.expanding = true;
                    st.dests.push(h);
                    rows.push((h, row_sector));
                }
                AcquireResult::Miss | AcquireResult::Exhausted => {
                    ok = false;
                    break;
                }
            }
        }

        if ok {
            'rows: for &(dest_h, row_sector) in &rows {
                let data_slots =
                    self.cache.get(dest_h).data_slots.clone();
                for dest_slot in data_slots {
                    let logical = geometry::compute_source_sector(
                        &cfg, row_sector, dest_slot, false,
                    )
                    .expect("data slot must map to a logical sector");
                    if logical >= total {
                        // Grown space past the old capacity: zero fill.
                        let d = self.cache.get_mut(dest_h);
                        d.slots[dest_slot].page.zero();
                        d.slots[dest_slot].flags.uptodate = true;
                        continue;
                    }
                    let addr = geometry::map_sector(&cfg, logical, true);
                    let src_row = page_align_sector(addr.stripe_sector);
                    let src_h =
                        match self.cache.acquire(&cfg, src_row, true, true) {
                            AcquireResult::Acquired(h) => h,
                            AcquireResult::Miss
                            | AcquireResult::Exhausted => {
                                ok = false;
                                break 'rows;
                            }
                        };
                    let src = self.cache.get_mut(src_h);
                    // A source still carrying caller writes must drain
                    // first, or the copy would miss them.
                    let busy = src.write_phase != WritePhase::Idle
                        || src.slots.iter().any(|s| {
                            !s.towrite.is_empty() || !s.written.is_empty()
                        });
                    if busy {
                        self.cache.release(src_h);
                        ok = false;
                        break 'rows;
                    }
                    src.flags.expanding = true;
                    let slot = &mut src.slots[addr.dd_idx];
                    if !slot.flags.uptodate
                        && !slot.flags.locked
                        && !slot.flags.wants_compute
                    {
                        if self.disks[addr.dd_idx].is_some() {
                            slot.flags.wants_read = true;
                        } else {
                            slot.flags.wants_compute = true;
                        }
                    }
                    self.cache.enqueue_handling(src_h);
                    st.fetches.push(Fetch {
                        src: src_h,
                        src_slot: addr.dd_idx,
                        dest: dest_h,
                        dest_slot,
                        done: false,
                    });
                }
            }
        }

        if !ok {
            for f in st.fetches.drain(..) {
                self.cache.get_mut(f.src).flags.expanding = false;
                self.cache.release(f.src);
            }
            for h in st.dests.drain(..) {
                self.cache.get_mut(h).flags.expanding = false;
                self.cache.release(h);
            }
            // Leave the window posted: parking overlapping I/O now
            // keeps the sources from going busy again immediately.
            return false;
        }
        true
    }

    fn finish_reshape(&mut self, total: u64) -> RecoveryState {
        if let Err(e) = self.save_checkpoint(CheckpointKind::Reshape, total) {
            error!(self.log, "final reshape checkpoint failed: {}", e);
            return RecoveryState::Stalled;
        }
        let mut def = (*self.cfg).clone();
        def.finish_reshape();
        self.cfg = Arc::new(def);
        self.recovery.window = None;
        info!(
            self.log,
            "reshape complete; capacity is now {} sectors",
            self.cfg.capacity_sectors()
        );
        RecoveryState::Idle
    }

    /**
     * Commit a reshape destination row: every data slot is populated,
     * so compute redundancy and write the whole row out.
     */
    fn commit_full_row(&mut self, h: StripeHandle) {
        let stripe = self.cache.get_mut(h);
        assert!(stripe
            .data_slots
            .iter()
            .all(|&s| stripe.slots[s].flags.uptodate));

        let (p_tmp, q_tmp) = {
            let data: Vec<&[u8]> = stripe
                .data_slots
                .iter()
                .map(|&s| stripe.slots[s].page.as_slice())
                .collect();
            let mut p = vec![0u8; PAGE_SIZE];
            let mut q = vec![0u8; PAGE_SIZE];
            match stripe.qd_idx {
                Some(_) => parity::compute_syndrome(&data, &mut p, &mut q),
                None => parity::compute_parity(&data, &mut p),
            }
            (p, q)
        };
        let pd = stripe.pd_idx;
        stripe.slots[pd].page.copy_in(0, &p_tmp);
        stripe.slots[pd].flags.uptodate = true;
        if let Some(q) = stripe.qd_idx {
            stripe.slots[q].page.copy_in(0, &q_tmp);
            stripe.slots[q].flags.uptodate = true;
        }
        for (i, slot) in stripe.slots.iter_mut().enumerate() {
            if self.disks[i].is_some() {
                slot.flags.wants_write = true;
            }
        }
        stripe.write_phase = WritePhase::WritingBack;
        let sector = stripe.sector;
        self.bitmap.mark_dirty_before_write(sector, STRIPE_SECTORS);
        self.stats.full_stripe_writes += 1;
        self.cache.enqueue_handling(h);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            JsonProgressStore::new(dir.path().join("progress.json"));

        assert!(store.load().unwrap().is_none());
        let cp = RecoveryCheckpoint {
            kind: CheckpointKind::Reshape,
            cursor: 12288,
            epoch: 2,
        };
        store.save(&cp).unwrap();
        assert_eq!(store.load().unwrap(), Some(cp.clone()));

        // Saves clobber: the newest cursor wins.
        let cp2 = RecoveryCheckpoint { cursor: 24576, ..cp };
        store.save(&cp2).unwrap();
        assert_eq!(store.load().unwrap(), Some(cp2));
    }

    #[test]
    fn test_window_overlap() {
        let log = palisade_common::build_logger();
        let mut drv = RecoveryDriver::new(None, log);
        assert!(!drv.blocks_logical(0, 100));

        drv.window = Some((128, 256));
        assert!(!drv.blocks_logical(0, 128));
        assert!(drv.blocks_logical(0, 129));
        assert!(drv.blocks_logical(200, 8));
        assert!(drv.blocks_logical(255, 8));
        assert!(!drv.blocks_logical(256, 64));
    }
}
