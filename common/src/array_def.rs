// Copyright 2026 Oxide Computer Company
use serde::{Deserialize, Serialize};

use crate::geometry::Algorithm;
use crate::units::STRIPE_SECTORS;
use crate::{raid_bail, RaidError};

#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RaidLevel {
    Raid4,
    Raid5,
    Raid6,
}

impl RaidLevel {
    /// Number of redundancy blocks per stripe (P, or P+Q).
    pub fn redundancy(&self) -> usize {
        match self {
            RaidLevel::Raid4 | RaidLevel::Raid5 => 1,
            RaidLevel::Raid6 => 2,
        }
    }
}

/**
 * The geometry of one array: member count, chunk size, level, and
 * parity rotation, plus the previous generation of all of those while a
 * reshape is in flight.
 *
 * The live engine never reads this through a lock.  A snapshot
 * (`Arc<ArrayDefinition>`) is captured once at the top of each stripe
 * evaluation; administrative changes publish a whole new snapshot.
 */
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ArrayDefinition {
    level: RaidLevel,

    /// Member disks under the current geometry.
    disks: usize,

    /// Sectors per chunk; power of two, whole pages.
    chunk_sectors: u64,

    algorithm: Algorithm,

    /// Usable sectors on every member disk.
    disk_sectors: u64,

    /// Geometry generation; bumped when a reshape begins.  A stripe is
    /// identified by (sector, epoch) so pre- and post-reshape stripes
    /// for the same sector never alias in the cache.
    epoch: u8,

    prev_disks: usize,
    prev_chunk_sectors: u64,
    prev_algorithm: Algorithm,

    /// Logical sector below which the new geometry applies; None when
    /// no reshape is running.
    reshape_position: Option<u64>,
}

impl ArrayDefinition {
    pub fn new(
        level: RaidLevel,
        disks: usize,
        chunk_sectors: u64,
        algorithm: Algorithm,
        disk_sectors: u64,
    ) -> Result<ArrayDefinition, RaidError> {
        if disks <= level.redundancy() {
            raid_bail!(
                InvalidDefinition,
                "level needs more than {} disks, got {}",
                level.redundancy(),
                disks
            );
        }
        if !chunk_sectors.is_power_of_two() || chunk_sectors < STRIPE_SECTORS {
            raid_bail!(
                InvalidDefinition,
                "chunk of {} sectors is not a power-of-two page multiple",
                chunk_sectors
            );
        }
        if disk_sectors == 0 || disk_sectors % chunk_sectors != 0 {
            raid_bail!(
                InvalidDefinition,
                "disk size {} is not a whole number of chunks",
                disk_sectors
            );
        }
        if !algorithm.valid_for(level) {
            raid_bail!(
                InvalidDefinition,
                "algorithm {:?} is not valid for {:?}",
                algorithm,
                level
            );
        }
        Ok(ArrayDefinition {
            level,
            disks,
            chunk_sectors,
            algorithm,
            disk_sectors,
            epoch: 0,
            prev_disks: disks,
            prev_chunk_sectors: chunk_sectors,
            prev_algorithm: algorithm,
            reshape_position: None,
        })
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    pub fn max_degraded(&self) -> usize {
        self.level.redundancy()
    }

    pub fn disks(&self, previous: bool) -> usize {
        if previous {
            self.prev_disks
        } else {
            self.disks
        }
    }

    pub fn chunk_sectors(&self, previous: bool) -> u64 {
        if previous {
            self.prev_chunk_sectors
        } else {
            self.chunk_sectors
        }
    }

    pub fn algorithm(&self, previous: bool) -> Algorithm {
        if previous {
            self.prev_algorithm
        } else {
            self.algorithm
        }
    }

    pub fn data_disks(&self, previous: bool) -> usize {
        self.disks(previous) - self.level.redundancy()
    }

    pub fn disk_sectors(&self) -> u64 {
        self.disk_sectors
    }

    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// The epoch a stripe mapped under the requested geometry carries.
    pub fn epoch_for(&self, previous: bool) -> u8 {
        if previous {
            self.epoch - 1
        } else {
            self.epoch
        }
    }

    pub fn reshape_position(&self) -> Option<u64> {
        self.reshape_position
    }

    pub fn reshape_active(&self) -> bool {
        self.reshape_position.is_some()
    }

    /**
     * Usable (data) capacity in sectors.  While a reshape runs, the
     * capacity of the old geometry is still the advertised one; the new
     * capacity only appears when the reshape finishes.
     */
    pub fn capacity_sectors(&self) -> u64 {
        let previous = self.reshape_active();
        self.data_disks(previous) as u64 * self.disk_sectors
    }

    /**
     * During a reshape, a logical sector below the progress cursor has
     * already been relocated and maps under the new geometry; at or
     * past the cursor it still lives under the old one.
     */
    pub fn use_previous_for(&self, logical: u64) -> bool {
        match self.reshape_position {
            None => false,
            Some(pos) => logical >= pos,
        }
    }

    pub fn begin_reshape(
        &mut self,
        new_disks: usize,
        new_chunk_sectors: u64,
        new_algorithm: Algorithm,
    ) -> Result<(), RaidError> {
        if self.reshape_active() {
            raid_bail!(ConflictingOperation, "reshape already in progress");
        }
        if new_disks < self.disks {
            raid_bail!(
                InvalidDefinition,
                "shrinking from {} to {} disks is not supported",
                self.disks,
                new_disks
            );
        }
        // Validate the target geometry the same way a fresh one is.
        let target = ArrayDefinition::new(
            self.level,
            new_disks,
            new_chunk_sectors,
            new_algorithm,
            self.disk_sectors,
        )?;

        self.prev_disks = self.disks;
        self.prev_chunk_sectors = self.chunk_sectors;
        self.prev_algorithm = self.algorithm;
        self.disks = target.disks;
        self.chunk_sectors = target.chunk_sectors;
        self.algorithm = target.algorithm;
        self.epoch = self.epoch.wrapping_add(1);
        self.reshape_position = Some(0);
        Ok(())
    }

    /// Move the reshape cursor forward.  Never backward.
    pub fn advance_reshape(&mut self, pos: u64) {
        let cur = self
            .reshape_position
            .expect("advance_reshape with no reshape running");
        assert!(pos >= cur);
        self.reshape_position = Some(pos);
    }

    pub fn finish_reshape(&mut self) {
        assert!(self.reshape_active());
        self.prev_disks = self.disks;
        self.prev_chunk_sectors = self.chunk_sectors;
        self.prev_algorithm = self.algorithm;
        self.reshape_position = None;
    }
}
