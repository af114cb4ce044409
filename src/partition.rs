// partition.rs
//! Boot partition locator.
//!
//! The partition-info table is read in one unencrypted transfer of
//! `round_up(count * 8, 0x20)` bytes. An empty primary group reads nothing.

use tracing::{debug, info, warn};

use crate::arena::{round_up, BootArena, DMA_ALIGN, PARTITION_TABLE_CAPACITY};
use crate::di::DiscDrive;
use crate::disc::{
    PartitionDescriptorTable, PartitionInfo, PartitionKind, DESCRIPTOR_OFFSET, PARTITION_INFO_SIZE,
};
use crate::error::{BootError, BootResult};
use crate::ios::IosTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPartition {
    pub index: usize,
    pub offset_words: u32,
}

impl BootPartition {
    pub fn byte_offset(&self) -> u64 {
        (self.offset_words as u64) << 2
    }
}

/// Bytes to request for `count` partition-info entries.
pub fn table_read_len(count: u32) -> usize {
    round_up(count as usize * PARTITION_INFO_SIZE, DMA_ALIGN)
}

/// First data partition in `entries`.
pub fn find_boot_partition<I>(entries: I) -> Option<BootPartition>
where
    I: IntoIterator<Item = PartitionInfo>,
{
    entries
        .into_iter()
        .enumerate()
        .find(|(_, info)| info.kind() == PartitionKind::Data)
        .map(|(index, info)| BootPartition { index, offset_words: info.offset_words })
}

pub fn locate<T: IosTransport>(drive: &DiscDrive<T>, arena: &mut BootArena) -> BootResult<BootPartition> {
    drive.read_unencrypted(&mut arena.descriptor[..], DESCRIPTOR_OFFSET)?;
    let descriptor = PartitionDescriptorTable::parse(&arena.descriptor[..])?;
    let primary = descriptor.primary();
    debug!(count = primary.count, table = primary.byte_offset(), "partition descriptor");

    if primary.count == 0 {
        return Err(BootError::NoBootPartition);
    }
    if primary.count as usize > PARTITION_TABLE_CAPACITY {
        return Err(BootError::PartitionTableTooLarge {
            count: primary.count,
            capacity: PARTITION_TABLE_CAPACITY,
        });
    }

    let len = table_read_len(primary.count);
    let table = &mut arena.partition_table[..len];
    drive.read_unencrypted(table, primary.byte_offset())?;

    let entries = table
        .chunks_exact(PARTITION_INFO_SIZE)
        .take(primary.count as usize)
        .map(PartitionInfo::parse);
    let partition = find_boot_partition(entries).ok_or(BootError::NoBootPartition)?;
    // offset 0 would be the disc header itself
    if partition.offset_words == 0 {
        warn!(index = partition.index, "boot partition has a zero offset");
        return Err(BootError::NoBootPartition);
    }

    info!(
        index = partition.index,
        offset = partition.byte_offset(),
        "boot partition located"
    );
    Ok(partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drive_for, DiscBuilder};

    fn locate_in(entries: &[(u32, u32)]) -> BootResult<BootPartition> {
        let image = DiscBuilder::new().partitions(entries).build();
        let drive = drive_for(image);
        drive.initialize().unwrap();
        let mut arena = BootArena::new();
        locate(&drive, &mut arena)
    }

    #[test]
    fn test_rounding_law() {
        assert_eq!(table_read_len(0), 0);
        assert_eq!(table_read_len(1), 0x20);
        assert_eq!(table_read_len(4), 0x20);
        assert_eq!(table_read_len(5), 0x40);
        assert_eq!(table_read_len(PARTITION_TABLE_CAPACITY as u32), 0x1000);
    }

    #[test]
    fn test_second_entry_selected() {
        let partition = locate_in(&[(0x50000, 1), (0x60000, 0)]).unwrap();
        assert_eq!(partition.index, 1);
        assert_eq!(partition.offset_words, 0x60000);
        assert_eq!(partition.byte_offset(), 0x60000 << 2);
    }

    #[test]
    fn test_no_data_partition() {
        let err = locate_in(&[(0x50000, 1), (0x60000, 2)]).unwrap_err();
        assert!(matches!(err, BootError::NoBootPartition));
        let err = locate_in(&[]).unwrap_err();
        assert!(matches!(err, BootError::NoBootPartition));
    }

    #[test]
    fn test_matches_reference_scan() {
        let mut seed = 0x1234_5678u32;
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            seed >> 8
        };
        for _ in 0..40 {
            let count = (next() % 12) as usize;
            let entries: Vec<(u32, u32)> =
                (0..count).map(|_| (0x1000 + next() % 0x8000, next() % 3)).collect();

            let expected = entries.iter().position(|&(_, kind)| kind == 0);
            match (locate_in(&entries), expected) {
                (Ok(found), Some(index)) => {
                    assert_eq!(found.index, index);
                    assert_eq!(found.offset_words, entries[index].0);
                }
                (Err(BootError::NoBootPartition), None) => {}
                (other, expected) => panic!("{:?} vs {:?} for {:?}", other, expected, entries),
            }
        }
    }

    #[test]
    fn test_oversized_table_rejected() {
        let image = DiscBuilder::new()
            .descriptor(PARTITION_TABLE_CAPACITY as u32 + 1, 0x40020 >> 2)
            .build();
        let drive = drive_for(image);
        drive.initialize().unwrap();
        let mut arena = BootArena::new();
        let err = locate(&drive, &mut arena).unwrap_err();
        assert!(matches!(err, BootError::PartitionTableTooLarge { count: 513, .. }));
    }

    #[test]
    fn test_zero_offset_data_partition_rejected() {
        let entries = [
            PartitionInfo { offset_words: 0, kind: 0 },
            PartitionInfo { offset_words: 0x14000, kind: 0 },
        ];
        assert_eq!(find_boot_partition(entries).unwrap().index, 0);

        // the later data partition is never considered
        let err = locate_in(&[(0, 0), (0x14000, 0)]).unwrap_err();
        assert!(matches!(err, BootError::NoBootPartition));
    }
}
