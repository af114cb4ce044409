// credentials.rs
//! Certificate chain, ticket and TMD gathering.
//!
//! The blobs are never interpreted here. They are collected into the arena
//! and later forwarded to the ES identify call.

use tracing::{debug, warn};

use crate::arena::BootArena;
use crate::channel::CommandChannel;
use crate::di::{DiscDrive, TICKET_SIZE, TMD_SIZE};
use crate::disc::{PartitionHeader, PARTITION_HEADER_SIZE};
use crate::error::{BootError, BootResult};
use crate::ios::{IosTransport, MODE_NONE, MODE_READ};

pub const CERTS_PATH: &str = "/sys/cert.sys";
pub const CERTS_SIZE: usize = 0xA00;

pub const ES_DEVICE: &str = "/dev/es";
pub const ES_IDENTIFY: u32 = 0x1C;

/// Byte of the TMD holding the IOS the game asks for.
pub const TMD_IOS_OFFSET: usize = 0x18B;

/// Borrowed view of the gathered blobs.
#[derive(Debug, Clone, Copy)]
pub struct CredentialSet<'a> {
    pub certificates: &'a [u8],
    pub ticket: &'a [u8],
    pub tmd: &'a [u8],
}

/// What was gathered into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CredentialLengths {
    pub certificates: usize,
    pub ticket: usize,
    pub tmd: usize,
}

impl CredentialLengths {
    pub fn view<'a>(&self, arena: &'a BootArena) -> CredentialSet<'a> {
        CredentialSet {
            certificates: &arena.certificates[..self.certificates],
            ticket: &arena.partition_header[..self.ticket],
            tmd: &arena.tmd[..self.tmd],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.certificates > 0 && self.ticket > 0 && self.tmd > 0
    }
}

/// Read the system certificate chain into `out`.
pub fn read_system_certificates<T: IosTransport>(
    channel: &CommandChannel<T>,
    out: &mut [u8],
) -> BootResult<usize> {
    let len = out.len().min(CERTS_SIZE);
    let mut guard = channel.lock()?;
    let transport = guard.transport_mut();

    let fd = transport.open(CERTS_PATH, MODE_READ);
    if fd < 0 {
        return Err(BootError::DeviceOpen { path: CERTS_PATH, code: fd });
    }
    let ret = transport.read(fd, &mut out[..len]);
    transport.close(fd);
    if ret < 0 {
        return Err(BootError::Credentials(ret));
    }
    Ok(ret as usize)
}

/// Gather the certificate chain and the boot partition's ticket. Must run
/// after the offset base points at the partition. A missing certificate
/// file only costs the later identify call.
pub fn gather<T: IosTransport>(drive: &DiscDrive<T>, arena: &mut BootArena) -> BootResult<CredentialLengths> {
    let certificates = match read_system_certificates(drive.channel(), &mut arena.certificates[..]) {
        Ok(len) => len,
        Err(err) => {
            warn!(error = %err, "system certificates unavailable");
            0
        }
    };

    drive.read_unencrypted(&mut arena.partition_header[..], 0)?;
    let header = PartitionHeader::parse(&arena.partition_header[..])?;
    debug!(
        tmd_size = header.tmd_size,
        tmd_offset = header.tmd_offset(),
        data_offset = header.data_offset(),
        "partition header"
    );

    Ok(CredentialLengths { certificates, ticket: TICKET_SIZE, tmd: 0 })
}

/// Record the TMD size once `OpenPartition` has filled the arena.
pub fn record_tmd(lengths: &mut CredentialLengths, arena: &BootArena) {
    let declared = PartitionHeader::parse(&arena.partition_header[..PARTITION_HEADER_SIZE])
        .map(|h| h.tmd_size as usize)
        .unwrap_or(0);
    lengths.tmd = if declared == 0 { TMD_SIZE } else { declared.min(TMD_SIZE) };
}

/// IOS version the game's TMD asks for.
pub fn requested_ios(tmd: &[u8]) -> Option<u8> {
    tmd.get(TMD_IOS_OFFSET).copied()
}

/// ES identify with the gathered set.
pub fn identify<T: IosTransport>(channel: &CommandChannel<T>, credentials: &CredentialSet<'_>) -> BootResult<()> {
    let mut guard = channel.lock()?;
    let transport = guard.transport_mut();

    let fd = transport.open(ES_DEVICE, MODE_NONE);
    if fd < 0 {
        return Err(BootError::DeviceOpen { path: ES_DEVICE, code: fd });
    }
    let mut key_id = [0u8; 4];
    let no_hashes: &[u8] = &[];
    let ret = transport.ioctlv(
        fd,
        ES_IDENTIFY,
        &[credentials.certificates, no_hashes, credentials.ticket, credentials.tmd],
        &mut [&mut key_id[..]],
    );
    transport.close(fd);
    if ret < 0 {
        return Err(BootError::Identify(ret));
    }
    debug!(key_id = u32::from_be_bytes(key_id), "identified as title");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drive_for, DiscBuilder, PARTITION_WORDS};

    #[test]
    fn test_gather_reads_ticket_and_certs() {
        let drive = drive_for(DiscBuilder::bootable().build());
        drive.initialize().unwrap();
        drive.set_offset_base((PARTITION_WORDS as u64) << 2).unwrap();

        let mut arena = BootArena::new();
        let mut lengths = gather(&drive, &mut arena).unwrap();
        assert_eq!(lengths.certificates, CERTS_SIZE);
        assert_eq!(lengths.ticket, TICKET_SIZE);
        // signature type of the ticket
        assert_eq!(&arena.partition_header[..4], &[0x00, 0x01, 0x00, 0x01]);

        drive
            .open_partition(PARTITION_WORDS, None, None, &mut arena.tmd[..])
            .unwrap();
        record_tmd(&mut lengths, &arena);
        assert!(lengths.is_complete());
        assert_eq!(requested_ios(&arena.tmd[..]), Some(36));

        let set = lengths.view(&arena);
        assert!(identify(drive.channel(), &set).is_ok());
    }

    #[test]
    fn test_identify_without_ticket_fails_softly() {
        let drive = drive_for(DiscBuilder::bootable().build());
        let arena = BootArena::new();
        let set = CredentialLengths::default().view(&arena);
        assert!(matches!(identify(drive.channel(), &set), Err(BootError::Identify(_))));
    }
}
