// Copyright 2026 Oxide Computer Company

/*!
 * A RAID-4/5/6 stripe-cache engine.
 *
 * Caller reads and writes address a linear logical space; the engine
 * maps them onto stripe rows across the member disks, keeps parity (and
 * the RAID-6 Q syndrome) coherent through partial writes, reconstructs
 * data reads that land on failed members, and runs background resync
 * and online reshape without stopping service.
 *
 * [`Array`] is the entry point; everything else hangs off the single
 * engine task it spawns.
 */

pub use palisade_common::*;

mod array;
mod bitmap;
mod buffer;
mod cache;
mod disk;
mod dispatch;
mod engine;
mod parity;
mod recovery;
mod request;
mod stats;
mod stripe;

pub use array::{Array, ArrayStatus};
pub use bitmap::{InMemoryBitmap, WriteIntentBitmap};
pub use disk::{DiskEndpoint, InMemoryDisk};
pub use recovery::{
    CheckpointKind, JsonProgressStore, ProgressStore, RecoveryCheckpoint,
    RepairMode,
};
pub use request::{RequestResult, RequestWaiter};
pub use stats::ArrayStats;

/// Index of a descriptor in the stripe pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StripeHandle(pub usize);

/// Identifies one caller request for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RequestId(pub u64);

impl std::fmt::Display for StripeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read errors tolerated from one member before it is ejected.
pub(crate) const DISK_ERROR_LIMIT: u32 = 3;

/// Stripes allowed to hold preread transfers at once; partial writes
/// past this are delayed until one finishes.
pub(crate) const PREREAD_BUDGET: usize = 8;

/// Default stripe pool population for [`Array::new`] callers without an
/// opinion.
pub const DEFAULT_CACHE_STRIPES: usize = 256;
