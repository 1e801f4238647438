// Copyright 2026 Oxide Computer Company
use serde::Serialize;

/// Counters the engine keeps as it works.  Monotonic; a snapshot is
/// returned by query, never reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrayStats {
    pub reads_issued: u64,
    pub writes_issued: u64,

    /// Partial-stripe writes committed by each strategy.
    pub rmw_writes: u64,
    pub rcw_writes: u64,
    /// Writes that covered a whole row and needed no prereads.
    pub full_stripe_writes: u64,

    /// Slot contents rebuilt from redundancy.
    pub reconstructions: u64,
    /// Failed reads retried against the same disk.
    pub read_retries: u64,
    /// Reconstructed pages written back over a latent read error.
    pub rewrites: u64,

    /// Parity inconsistencies found by check/repair passes.
    pub mismatches: u64,

    /// Caller requests that completed with an error.
    pub requests_failed: u64,
}
