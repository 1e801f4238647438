// Copyright 2026 Oxide Computer Company

/*
 * Where the unit is sectors, not bytes, make sure to reflect that in
 * names.  Everything at and below the engine addresses in 512-byte
 * sectors; one stripe slot holds one page worth of them.
 */

/// 512-byte sectors, the only addressing unit member disks understand.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// One stripe slot carries one page of data per member disk.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Sectors per stripe slot page.
pub const STRIPE_SECTORS: u64 = (PAGE_SIZE >> SECTOR_SHIFT) as u64;

/// Convert a sector count to bytes.
pub fn sectors_to_bytes(sectors: u64) -> usize {
    (sectors as usize) << SECTOR_SHIFT
}

/// Convert a byte length to sectors, panicking on a ragged length.
pub fn bytes_to_sectors(bytes: usize) -> u64 {
    assert_eq!(bytes % SECTOR_SIZE, 0);
    (bytes >> SECTOR_SHIFT) as u64
}

/// Round a sector down to the start of its stripe slot page.
pub fn page_align_sector(sector: u64) -> u64 {
    sector & !(STRIPE_SECTORS - 1)
}
