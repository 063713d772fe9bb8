//! Segment-scoped allocation
//!
//! A first-fit free list over a bump region. Blocks carry their payload
//! size in the four bytes before the payload; freed blocks chain through
//! the first four bytes of their payload. Offsets are relative to the
//! segment base, so they mean the same thing in every attached process.

use super::segment::{align4, SharedSegment};
use crate::error::{Error, Result};
use std::mem;

impl SharedSegment {
    /// Allocate `len` bytes inside the segment; the returned offset is
    /// valid in every process mapping this segment.
    pub fn alloc(&self, len: usize) -> Result<u32> {
        let need = align4(len.max(4)) as u32;

        // First fit from the free list.
        let mut prev: u32 = 0;
        let mut cur = self.header().free_head;
        while cur != 0 {
            let block_size: u32 = self.read_at(cur - 4);
            let next: u32 = self.read_at(cur);
            if block_size >= need {
                if prev == 0 {
                    self.header_mut().free_head = next;
                } else {
                    self.write_at(prev, next);
                }
                self.zero(cur, block_size as usize);
                return Ok(cur);
            }
            prev = cur;
            cur = next;
        }

        // Fresh block from the bump region.
        let start = self.header().bump;
        let payload = start + 4;
        let end = payload as usize + need as usize;
        if end > self.size() {
            return Err(Error::SegmentExhausted(self.name().to_string()));
        }

        self.write_at(start, need);
        self.header_mut().bump = end as u32;
        self.zero(payload, need as usize);
        Ok(payload)
    }

    /// Return a block to the free list
    pub fn free(&self, offset: u32) {
        if offset == 0 {
            return;
        }
        let head = self.header().free_head;
        self.write_at(offset, head);
        self.header_mut().free_head = offset;
    }

    /// Allocate a length-prefixed string
    pub fn alloc_str(&self, value: &str) -> Result<u32> {
        let bytes = value.as_bytes();
        let offset = self.alloc(4 + bytes.len())?;
        self.write_at(offset, bytes.len() as u32);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base().add(offset as usize + 4),
                bytes.len(),
            );
        }
        Ok(offset)
    }

    /// Read a length-prefixed string; a zero offset reads as empty
    pub fn read_str(&self, offset: u32) -> String {
        if offset == 0 {
            return String::new();
        }
        let len: u32 = self.read_at(offset);
        let len = (len as usize).min(self.size().saturating_sub(offset as usize + 4));
        let bytes = unsafe {
            std::slice::from_raw_parts(self.base().add(offset as usize + 4), len)
        };
        String::from_utf8_lossy(bytes).into_owned()
    }

    /// Free a string allocated with [`SharedSegment::alloc_str`]
    pub fn free_str(&self, offset: u32) {
        self.free(offset);
    }

    /// Replace a stored string, freeing the old block
    pub fn replace_str(&self, offset: u32, value: &str) -> Result<u32> {
        let new = self.alloc_str(value)?;
        self.free_str(offset);
        Ok(new)
    }

    /// Read a plain-old-data record at an offset
    pub fn read_at<T: Copy>(&self, offset: u32) -> T {
        debug_assert!(offset as usize + mem::size_of::<T>() <= self.size());
        unsafe { std::ptr::read_unaligned(self.base().add(offset as usize) as *const T) }
    }

    /// Write a plain-old-data record at an offset
    pub fn write_at<T: Copy>(&self, offset: u32, value: T) {
        debug_assert!(offset as usize + mem::size_of::<T>() <= self.size());
        unsafe {
            std::ptr::write_unaligned(self.base().add(offset as usize) as *mut T, value);
        }
    }

    fn zero(&self, offset: u32, len: usize) {
        unsafe {
            std::ptr::write_bytes(self.base().add(offset as usize), 0, len);
        }
    }
}
