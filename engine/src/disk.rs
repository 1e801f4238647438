// Copyright 2026 Oxide Computer Company
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use palisade_common::{sectors_to_bytes, RaidError, SECTOR_SIZE};

/**
 * One member disk.  The engine only ever issues page-sized, page-aligned
 * transfers at per-disk sector offsets; implementations do not need to
 * handle anything smaller.
 *
 * Implementations must be safe to call from multiple spawned tasks at
 * once: the dispatcher runs each transfer on its own task.
 */
#[async_trait]
pub trait DiskEndpoint: std::fmt::Debug + Send + Sync {
    async fn read(&self, sector: u64, data: &mut [u8]) -> Result<(), RaidError>;
    async fn write(&self, sector: u64, data: &[u8]) -> Result<(), RaidError>;
    fn sector_count(&self) -> u64;
}

/**
 * A member disk backed by a Vec, with failure injection for tests: whole
 *-device read/write failure, and individual unreadable sectors that a
 * rewrite repairs (the way a real disk remaps a latent bad sector when
 * it is next written).
 */
#[derive(Debug)]
pub struct InMemoryDisk {
    sector_count: u64,
    inner: Mutex<Inner>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    bad_sectors: HashSet<u64>,
}

impl InMemoryDisk {
    pub fn new(sector_count: u64) -> InMemoryDisk {
        InMemoryDisk {
            sector_count,
            inner: Mutex::new(Inner {
                bytes: vec![0; sectors_to_bytes(sector_count)],
                bad_sectors: HashSet::new(),
            }),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make one sector unreadable until it is next written.
    pub fn add_bad_sector(&self, sector: u64) {
        self.inner.lock().unwrap().bad_sectors.insert(sector);
    }

    pub fn bad_sector_count(&self) -> usize {
        self.inner.lock().unwrap().bad_sectors.len()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read raw contents, bypassing injected failures.  Test inspection
    /// only.
    pub fn peek(&self, sector: u64, data: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        let off = sectors_to_bytes(sector);
        data.copy_from_slice(&inner.bytes[off..off + data.len()]);
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<(), RaidError> {
        assert_eq!(len % SECTOR_SIZE, 0);
        let sectors = (len / SECTOR_SIZE) as u64;
        if sector + sectors > self.sector_count {
            return Err(RaidError::IoError(format!(
                "transfer [{}, {}) past end of disk ({})",
                sector,
                sector + sectors,
                self.sector_count
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DiskEndpoint for InMemoryDisk {
    async fn read(
        &self,
        sector: u64,
        data: &mut [u8],
    ) -> Result<(), RaidError> {
        self.check_range(sector, data.len())?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RaidError::IoError("injected read failure".to_string()));
        }
        let inner = self.inner.lock().unwrap();
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        for s in sector..sector + sectors {
            if inner.bad_sectors.contains(&s) {
                return Err(RaidError::IoError(format!(
                    "unreadable sector {}",
                    s
                )));
            }
        }
        let off = sectors_to_bytes(sector);
        data.copy_from_slice(&inner.bytes[off..off + data.len()]);
        Ok(())
    }

    async fn write(&self, sector: u64, data: &[u8]) -> Result<(), RaidError> {
        self.check_range(sector, data.len())?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RaidError::IoError(
                "injected write failure".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        for s in sector..sector + sectors {
            inner.bad_sectors.remove(&s);
        }
        let off = sectors_to_bytes(sector);
        inner.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}
