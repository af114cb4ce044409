// memory.rs
//! Main memory (MEM1) as seen by the loaded game.
//!
//! Addresses are effective addresses in the cached (0x8xxxxxxx) or uncached
//! (0xCxxxxxxx) segment, or plain physical addresses. All multi-byte values
//! are big-endian.

use std::ptr;

use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use tracing::debug;

use crate::error::{BootError, BootResult};

pub const MEM1_BASE: u32 = 0x8000_0000;
pub const MEM1_SIZE: usize = 0x0180_0000;
pub const MEM1_END: u32 = MEM1_BASE + MEM1_SIZE as u32;

/// Physical offset of `addr` inside MEM1, if `addr..addr+len` fits.
pub fn mem1_offset(addr: u32, len: usize) -> BootResult<usize> {
    let physical = match addr >> 28 {
        0x8 | 0xC => (addr & 0x1FFF_FFFF) as usize,
        0x0 | 0x1 => addr as usize,
        _ => return Err(BootError::MemoryRange { addr, len }),
    };
    match physical.checked_add(len) {
        Some(end) if end <= MEM1_SIZE => Ok(physical),
        _ => Err(BootError::MemoryRange { addr, len }),
    }
}

pub trait MainMemory {
    fn region(&self, addr: u32, len: usize) -> BootResult<&[u8]>;

    fn region_mut(&mut self, addr: u32, len: usize) -> BootResult<&mut [u8]>;

    fn read_u32(&self, addr: u32) -> BootResult<u32> {
        let b = self.region(addr, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> BootResult<()> {
        self.region_mut(addr, 4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_slice(&mut self, addr: u32, data: &[u8]) -> BootResult<()> {
        self.region_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }
}

// ============================================================================
// HOST MEM1
// ============================================================================

/// Anonymous mapping standing in for MEM1 on a host.
pub struct GuestMemory {
    ptr: *mut u8,
    len: usize,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for GuestMemory {}

impl GuestMemory {
    pub fn new() -> BootResult<Self> {
        Self::with_size(MEM1_SIZE)
    }

    fn with_size(len: usize) -> BootResult<Self> {
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(BootError::MemoryAllocation(format!(
                "mmap failed (Size: {} MB)",
                len / 1024 / 1024
            )));
        }
        debug!(size = len, "MEM1 mapped");
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole window, for dumps.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl MainMemory for GuestMemory {
    fn region(&self, addr: u32, len: usize) -> BootResult<&[u8]> {
        let offset = mem1_offset(addr, len)?;
        unsafe { Ok(std::slice::from_raw_parts(self.ptr.add(offset), len)) }
    }

    fn region_mut(&mut self, addr: u32, len: usize) -> BootResult<&mut [u8]> {
        let offset = mem1_offset(addr, len)?;
        unsafe { Ok(std::slice::from_raw_parts_mut(self.ptr.add(offset), len)) }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                munmap(self.ptr as *mut c_void, self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_translation() {
        assert_eq!(mem1_offset(0x8000_0000, 4).unwrap(), 0);
        assert_eq!(mem1_offset(0xC000_3180, 4).unwrap(), 0x3180);
        assert_eq!(mem1_offset(0x0120_0000, 0x20).unwrap(), 0x120_0000);
        assert_eq!(mem1_offset(0x817F_FFFC, 4).unwrap(), 0x17F_FFFC);
    }

    #[test]
    fn test_out_of_window() {
        assert!(mem1_offset(0x817F_FFFC, 8).is_err());
        assert!(mem1_offset(0x8180_0000, 1).is_err());
        assert!(mem1_offset(0x9000_0000, 4).is_err());
        assert!(matches!(
            mem1_offset(0x4000_0000, 4),
            Err(BootError::MemoryRange { addr: 0x4000_0000, len: 4 })
        ));
    }

    #[test]
    fn test_big_endian_words() {
        let mut mem = GuestMemory::new().unwrap();
        mem.write_u32(0x8000_0020, 0x0D15_EA5E).unwrap();
        assert_eq!(mem.region(0x8000_0020, 4).unwrap(), &[0x0D, 0x15, 0xEA, 0x5E]);
        assert_eq!(mem.read_u32(0xC000_0020).unwrap(), 0x0D15_EA5E);
    }

    #[test]
    fn test_regions_are_dma_aligned() {
        let mut mem = GuestMemory::new().unwrap();
        let region = mem.region_mut(0x8120_0000, 0x1020).unwrap();
        assert_eq!(region.as_ptr() as usize % 32, 0);
        assert!(region.iter().all(|b| *b == 0));
    }
}
