// arena.rs
//! Fixed scratch buffers for one disc-boot attempt.
//!
//! Every buffer handed to the drive is 32-byte aligned because the transport
//! moves it with DMA. The arena is allocated once, reused by every attempt
//! and never grows.

use std::ops::{Deref, DerefMut};

pub const DMA_ALIGN: usize = 0x20;

/// Entries the partition-info scratch buffer can hold.
pub const PARTITION_TABLE_CAPACITY: usize = 512;
pub const PARTITION_TABLE_BYTES: usize = PARTITION_TABLE_CAPACITY * 8;

/// The TMD reply is 0x49E4 bytes; the buffer is rounded up to the DMA unit.
pub const TMD_BUFFER_BYTES: usize = 0x4A00;

/// `N` bytes starting on a 32-byte boundary.
#[repr(C, align(32))]
#[derive(Clone)]
pub struct Aligned<const N: usize>([u8; N]);

impl<const N: usize> Aligned<N> {
    pub const fn zeroed() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> Deref for Aligned<N> {
    type Target = [u8; N];

    fn deref(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> DerefMut for Aligned<N> {
    fn deref_mut(&mut self) -> &mut [u8; N] {
        &mut self.0
    }
}

pub fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

pub fn is_dma_aligned(buf: &[u8]) -> bool {
    buf.as_ptr() as usize % DMA_ALIGN == 0
}

pub struct BootArena {
    pub disc_id: Aligned<0x20>,
    pub header: Aligned<0x800>,
    pub descriptor: Aligned<0x20>,
    pub partition_table: Aligned<PARTITION_TABLE_BYTES>,
    /// Ticket plus the TMD/cert locations of the boot partition.
    pub partition_header: Aligned<0x800>,
    pub certificates: Aligned<0xA00>,
    pub tmd: Aligned<TMD_BUFFER_BYTES>,
    pub apploader_header: Aligned<0x20>,
}

impl BootArena {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            disc_id: Aligned::zeroed(),
            header: Aligned::zeroed(),
            descriptor: Aligned::zeroed(),
            partition_table: Aligned::zeroed(),
            partition_header: Aligned::zeroed(),
            certificates: Aligned::zeroed(),
            tmd: Aligned::zeroed(),
            apploader_header: Aligned::zeroed(),
        })
    }

    /// Zero every buffer before a new attempt.
    pub fn reset(&mut self) {
        self.disc_id.fill(0);
        self.header.fill(0);
        self.descriptor.fill(0);
        self.partition_table.fill(0);
        self.partition_header.fill(0);
        self.certificates.fill(0);
        self.tmd.fill(0);
        self.apploader_header.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_buffers_are_dma_aligned() {
        let arena = BootArena::new();
        assert!(is_dma_aligned(&arena.disc_id[..]));
        assert!(is_dma_aligned(&arena.header[..]));
        assert!(is_dma_aligned(&arena.descriptor[..]));
        assert!(is_dma_aligned(&arena.partition_table[..]));
        assert!(is_dma_aligned(&arena.partition_header[..]));
        assert!(is_dma_aligned(&arena.certificates[..]));
        assert!(is_dma_aligned(&arena.tmd[..]));
        assert!(is_dma_aligned(&arena.apploader_header[..]));
        assert!(arena.tmd.len() >= 0x49E4);
        assert_eq!(arena.tmd.len() % DMA_ALIGN, 0);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 0x20), 0);
        assert_eq!(round_up(8, 0x20), 0x20);
        assert_eq!(round_up(0x20, 0x20), 0x20);
        assert_eq!(round_up(0x28, 0x20), 0x40);
    }

    #[test]
    fn test_reset_clears() {
        let mut arena = BootArena::new();
        arena.tmd[0x18B] = 36;
        arena.header[0] = b'R';
        arena.reset();
        assert_eq!(arena.tmd[0x18B], 0);
        assert_eq!(arena.header[0], 0);
    }
}
