// launch.rs
//! Final hand-off to the loaded game.
//!
//! After the copy loop is done, the low-memory globals the apploader does
//! not set are written, the display is configured, the application range
//! is flushed and every resource is released. What is left is a
//! [`Handoff`], whose only operation never returns.

use tracing::{info, warn};

use crate::apploader::ApploaderCallbacks;
use crate::channel::CommandChannel;
use crate::credentials::{self, CredentialSet};
use crate::di::DiscDrive;
use crate::error::{BootError, BootResult};
use crate::ios::IosTransport;
use crate::memory::{MainMemory, MEM1_BASE};
use crate::platform::{Branch, Platform};
use crate::video::VideoMode;

// ============================================================================
// LOW MEMORY
// ============================================================================

pub const DISC_ID_ADDR: u32 = 0x8000_0000;
pub const REGION_ADDR: u32 = 0x8000_0003;
pub const SYS_MAGIC_ADDR: u32 = 0x8000_0020;
pub const VERSION_ADDR: u32 = 0x8000_0024;
pub const ARENA_LO_ADDR: u32 = 0x8000_0030;
pub const ARENA_HI_ADDR: u32 = 0x8000_0034;
pub const FST_ADDR: u32 = 0x8000_0038;
pub const FST_MAX_ADDR: u32 = 0x8000_003C;
pub const VIDEO_MODE_ADDR: u32 = 0x8000_00CC;
pub const BUS_SPEED_ADDR: u32 = 0x8000_00F8;
pub const CPU_SPEED_ADDR: u32 = 0x8000_00FC;
pub const ONLINE_CHECK_ADDR: u32 = 0x8000_3180;

pub const SYS_MAGIC: u32 = 0x0D15_EA5E;
pub const SYS_VERSION: u32 = 1;
pub const BUS_SPEED: u32 = 0x0E7B_E2C0;
pub const CPU_SPEED: u32 = 0x2B73_A840;

/// Length flushed before the jump, from 0x80000000.
pub const APP_MEMORY_LEN: usize = 0x017F_FFFF;

pub fn write_boot_globals(memory: &mut dyn MainMemory, video: VideoMode) -> BootResult<()> {
    memory.write_u32(SYS_MAGIC_ADDR, SYS_MAGIC)?;
    memory.write_u32(VERSION_ADDR, SYS_VERSION)?;
    memory.write_u32(ARENA_LO_ADDR, 0)?;
    memory.write_u32(BUS_SPEED_ADDR, BUS_SPEED)?;
    memory.write_u32(CPU_SPEED_ADDR, CPU_SPEED)?;

    let id = memory.read_u32(DISC_ID_ADDR)?;
    memory.write_u32(ONLINE_CHECK_ADDR, id)?;

    memory.write_u32(VIDEO_MODE_ADDR, video.word())?;
    Ok(())
}

// ============================================================================
// HANDOFF
// ============================================================================

/// Everything is released; only the jump is left.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a handoff does nothing until jumped to"]
pub struct Handoff {
    entry: u32,
}

impl Handoff {
    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn jump<B: Branch + ?Sized>(self, branch: &mut B, memory: &dyn MainMemory) -> ! {
        info!(entry = format_args!("{:#010x}", self.entry), "jumping to game");
        branch.branch(self.entry, memory)
    }
}

/// Resources released right before the jump.
pub struct Release<'a, T: IosTransport> {
    pub drive: &'a DiscDrive<T>,
    pub channel: &'a CommandChannel<T>,
    pub credentials: Option<CredentialSet<'a>>,
}

pub fn prepare<T, C>(
    callbacks: &mut C,
    video: VideoMode,
    memory: &mut dyn MainMemory,
    platform: &mut Platform,
    release: Release<'_, T>,
) -> BootResult<Handoff>
where
    T: IosTransport,
    C: ApploaderCallbacks,
{
    let entry = callbacks.exit(memory);
    if entry == 0 {
        return Err(BootError::NullEntryPoint);
    }

    write_boot_globals(memory, video)?;
    platform.display.configure(video);
    platform.cache.flush_range(memory.region(MEM1_BASE, APP_MEMORY_LEN)?);

    platform.logger.close();
    platform.storage.release();
    if let Err(err) = release.drive.stop_motor() {
        warn!(error = %err, "could not stop the motor before launch");
    }
    release.drive.close();

    match release.credentials {
        Some(set) => {
            if let Err(err) = credentials::identify(release.channel, &set) {
                warn!(error = %err, "identify failed, launching anyway");
            }
        }
        None => warn!("no credentials gathered, skipping identify"),
    }

    info!(entry = format_args!("{:#010x}", entry), video = %video, "ready to launch");
    Ok(Handoff { entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemory;

    #[test]
    fn test_boot_globals() {
        let mut memory = GuestMemory::new().unwrap();
        memory.write_slice(DISC_ID_ADDR, b"RSPE01").unwrap();
        write_boot_globals(&mut memory, VideoMode::Pal).unwrap();

        assert_eq!(memory.read_u32(SYS_MAGIC_ADDR).unwrap(), 0x0D15_EA5E);
        assert_eq!(memory.read_u32(VERSION_ADDR).unwrap(), 1);
        assert_eq!(memory.read_u32(ARENA_LO_ADDR).unwrap(), 0);
        assert_eq!(memory.read_u32(BUS_SPEED_ADDR).unwrap(), 0x0E7B_E2C0);
        assert_eq!(memory.read_u32(CPU_SPEED_ADDR).unwrap(), 0x2B73_A840);
        assert_eq!(memory.region(ONLINE_CHECK_ADDR, 4).unwrap(), b"RSPE");
        assert_eq!(memory.read_u32(VIDEO_MODE_ADDR).unwrap(), 1);
        assert_eq!(memory.region(REGION_ADDR, 1).unwrap(), b"E");
    }

    #[test]
    fn test_app_range_fits_mem1() {
        let memory = GuestMemory::new().unwrap();
        assert_eq!(memory.region(MEM1_BASE, APP_MEMORY_LEN).unwrap().len(), 0x17F_FFFF);
    }
}
