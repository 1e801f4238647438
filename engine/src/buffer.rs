// Copyright 2026 Oxide Computer Company
use bytes::{BufMut, BytesMut};

use palisade_common::PAGE_SIZE;

/**
 * One stripe slot's worth of data: exactly one page.  The backing
 * storage is allocated once when the slot is created and reused across
 * every stripe the slot's descriptor is recycled for.
 */
pub(crate) struct Page {
    data: BytesMut,
}

impl Page {
    pub fn new() -> Page {
        let mut data = BytesMut::with_capacity(PAGE_SIZE);
        data.put_bytes(0, PAGE_SIZE);
        Page { data }
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` into the page at a byte offset.
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= PAGE_SIZE);
        self.data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy a byte range of the page out into `dst`.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= PAGE_SIZE);
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Page[{}]", self.data.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_copy_in_out() {
        let mut p = Page::new();
        assert!(p.as_slice().iter().all(|&b| b == 0));

        p.copy_in(512, &[0xab; 1024]);
        let mut out = vec![0u8; 1024];
        p.copy_out(512, &mut out);
        assert!(out.iter().all(|&b| b == 0xab));

        // Neighbours untouched.
        let mut edge = vec![0u8; 512];
        p.copy_out(0, &mut edge);
        assert!(edge.iter().all(|&b| b == 0));

        p.zero();
        assert!(p.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn test_page_copy_in_overrun() {
        let mut p = Page::new();
        p.copy_in(PAGE_SIZE - 100, &[0u8; 101]);
    }
}
