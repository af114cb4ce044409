// di.rs
//! Disc interface driver.
//!
//! Each operation checks its buffers first, then holds the channel lock
//! from populating the command block until it has read the reply. Offsets
//! are taken in bytes and sent in the drive's 4-byte units.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::arena::is_dma_aligned;
use crate::channel::{ChannelGuard, CommandChannel, Ioctl};
use crate::error::{BootError, BootResult};
use crate::ios::{Fd, IosTransport, MODE_NONE};

pub const DI_DEVICE: &str = "/dev/di";

pub const TICKET_SIZE: usize = 0x2A4;
pub const TMD_SIZE: usize = 0x49E4;
pub const DISC_ID_SIZE: usize = 0x20;

const CLOSED: Fd = -1;

/// Drive firmware information returned by `Inquiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveInfo {
    pub revision: u16,
    pub device_code: u16,
    pub release_date: u32,
}

pub struct DiscDrive<T: IosTransport> {
    channel: Arc<CommandChannel<T>>,
    handle: AtomicI32,
}

fn check_buffer(command: Ioctl, buf: &[u8]) -> BootResult<()> {
    if buf.is_empty() {
        return Err(BootError::NullBuffer(command));
    }
    if !is_dma_aligned(buf) {
        return Err(BootError::Misaligned { command, addr: buf.as_ptr() as usize });
    }
    Ok(())
}

fn to_units(command: Ioctl, offset: u64) -> BootResult<u32> {
    if offset % 4 != 0 || offset >> 2 > u32::MAX as u64 {
        return Err(BootError::InvalidOffset { command, offset });
    }
    Ok((offset >> 2) as u32)
}

fn transfer_len(command: Ioctl, buf: &[u8]) -> BootResult<u32> {
    u32::try_from(buf.len()).map_err(|_| BootError::BufferTooSmall {
        command,
        needed: u32::MAX as usize,
        available: buf.len(),
    })
}

impl<T: IosTransport> DiscDrive<T> {
    pub fn new(channel: Arc<CommandChannel<T>>) -> Self {
        Self { channel, handle: AtomicI32::new(CLOSED) }
    }

    pub fn channel(&self) -> &Arc<CommandChannel<T>> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.handle.load(Ordering::Acquire) >= 0
    }

    fn fd(&self) -> BootResult<Fd> {
        let fd = self.handle.load(Ordering::Acquire);
        if fd < 0 {
            return Err(BootError::NotInitialized);
        }
        Ok(fd)
    }

    /// Run a command whose reply fits the shared reply block. The guard is
    /// returned still locked so the caller can inspect the reply.
    fn command(&self, ioctl: Ioctl, params: &[u32]) -> BootResult<ChannelGuard<'_, T>> {
        let fd = self.fd()?;
        let mut channel = self.channel.lock()?;
        channel.prepare(ioctl).set_params(params);
        let ret = channel.ioctl(fd, ioctl);
        channel.finish(ioctl, ret)?;
        Ok(channel)
    }

    fn transfer(&self, ioctl: Ioctl, buf: &mut [u8], offset: u64) -> BootResult<()> {
        check_buffer(ioctl, buf)?;
        let units = to_units(ioctl, offset)?;
        let len = transfer_len(ioctl, buf)?;
        let fd = self.fd()?;

        let mut channel = self.channel.lock()?;
        channel.prepare(ioctl).set_params(&[len, units]);
        let ret = channel.ioctl_into(fd, ioctl, buf);
        channel.finish(ioctl, ret)?;
        channel.metrics().record_bytes_read(len as u64);
        Ok(())
    }

    // ========================================================================
    // HANDLE
    // ========================================================================

    /// Open the device. A handle that is already open is kept.
    pub fn initialize(&self) -> BootResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let fd = self.channel.lock()?.transport_mut().open(DI_DEVICE, MODE_NONE);
        if fd < 0 {
            return Err(BootError::DeviceOpen { path: DI_DEVICE, code: fd });
        }
        self.handle.store(fd, Ordering::Release);
        debug!(fd, "disc interface opened");
        Ok(())
    }

    /// Drop the handle. Safe to call when already closed.
    pub fn close(&self) {
        let fd = self.handle.swap(CLOSED, Ordering::AcqRel);
        if fd < 0 {
            return;
        }
        // Nothing useful to do when close fails; the handle is gone either way.
        if let Ok(mut channel) = self.channel.lock() {
            channel.transport_mut().close(fd);
        }
        debug!(fd, "disc interface closed");
    }

    /// Forget the handle without closing it, after an IOS reload has
    /// already invalidated it.
    pub fn invalidate(&self) {
        self.handle.store(CLOSED, Ordering::Release);
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    pub fn inquiry(&self) -> BootResult<DriveInfo> {
        let channel = self.command(Ioctl::Inquiry, &[])?;
        let word0 = channel.output_word(0);
        Ok(DriveInfo {
            revision: (word0 >> 16) as u16,
            device_code: word0 as u16,
            release_date: channel.output_word(1),
        })
    }

    /// Copy the 32-byte disc identity into `out`.
    pub fn read_disc_id(&self, out: &mut [u8]) -> BootResult<()> {
        if out.len() < DISC_ID_SIZE {
            return Err(BootError::BufferTooSmall {
                command: Ioctl::ReadId,
                needed: DISC_ID_SIZE,
                available: out.len(),
            });
        }
        let channel = self.command(Ioctl::ReadId, &[])?;
        out[..DISC_ID_SIZE].copy_from_slice(&channel.output()[..DISC_ID_SIZE]);
        Ok(())
    }

    /// Decrypted read relative to the current offset base.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> BootResult<()> {
        self.transfer(Ioctl::Read, buf, offset)
    }

    /// Raw read relative to the current offset base.
    pub fn read_unencrypted(&self, buf: &mut [u8], offset: u64) -> BootResult<()> {
        self.transfer(Ioctl::ReadUnencrypted, buf, offset)
    }

    /// Blocks until the cover is closed. There is no timeout.
    pub fn wait_cover_close(&self) -> BootResult<()> {
        info!("waiting for the drive cover to close");
        self.command(Ioctl::WaitCoverClose, &[]).map(drop)
    }

    /// `true` when a disc is present.
    pub fn verify_cover(&self) -> BootResult<bool> {
        let channel = self.command(Ioctl::GetCover, &[])?;
        Ok(channel.output_word(0) == 0)
    }

    pub fn reset(&self) -> BootResult<()> {
        self.command(Ioctl::Reset, &[1]).map(drop)
    }

    /// Open the partition at `offset_words`. Missing ticket or certificates
    /// are sent as empty vectors. The TMD lands in `tmd`.
    pub fn open_partition(
        &self,
        offset_words: u32,
        ticket: Option<&[u8]>,
        certificates: Option<&[u8]>,
        tmd: &mut [u8],
    ) -> BootResult<()> {
        let ioctl = Ioctl::OpenPartition;
        check_buffer(ioctl, tmd)?;
        if tmd.len() < TMD_SIZE {
            return Err(BootError::BufferTooSmall {
                command: ioctl,
                needed: TMD_SIZE,
                available: tmd.len(),
            });
        }
        let ticket: &[u8] = match ticket {
            Some(t) => {
                check_buffer(ioctl, t)?;
                if t.len() < TICKET_SIZE {
                    return Err(BootError::BufferTooSmall {
                        command: ioctl,
                        needed: TICKET_SIZE,
                        available: t.len(),
                    });
                }
                &t[..TICKET_SIZE]
            }
            None => &[],
        };
        let certificates: &[u8] = match certificates {
            Some(c) => {
                check_buffer(ioctl, c)?;
                c
            }
            None => &[],
        };
        let fd = self.fd()?;

        let mut channel = self.channel.lock()?;
        channel.prepare(ioctl).set_params(&[offset_words]);
        let ret = channel.ioctlv(
            fd,
            ioctl,
            &[ticket, certificates],
            &mut [&mut tmd[..TMD_SIZE]],
        );
        channel.finish(ioctl, ret)?;
        info!(offset = (offset_words as u64) << 2, "partition opened");
        Ok(())
    }

    pub fn close_partition(&self) -> BootResult<()> {
        self.command(Ioctl::ClosePartition, &[]).map(drop)
    }

    pub fn enable_dvd(&self) -> BootResult<()> {
        self.command(Ioctl::EnableDvd, &[1]).map(drop)
    }

    /// Rebase later reads to the absolute byte offset `base`.
    pub fn set_offset_base(&self, base: u64) -> BootResult<()> {
        let units = to_units(Ioctl::SetOffsetBase, base)?;
        self.command(Ioctl::SetOffsetBase, &[units]).map(drop)
    }

    pub fn get_offset_base(&self) -> BootResult<u64> {
        let channel = self.command(Ioctl::GetOffsetBase, &[])?;
        Ok((channel.output_word(0) as u64) << 2)
    }

    /// Spin down. Eject and kill flags stay clear.
    pub fn stop_motor(&self) -> BootResult<()> {
        self.command(Ioctl::StopMotor, &[0, 0]).map(drop)
    }
}
