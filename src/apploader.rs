// apploader.rs
//! Apploader loading and its callback protocol.
//!
//! The apploader is a small program stored at a fixed place in the boot
//! partition. Its start routine hands back three callbacks: `init` (wires a
//! progress reporter), `main` (yields one segment per call) and `close`
//! (returns the game's entry point). [`ApploaderRuntime`] hides how the start
//! routine is invoked: natively on the console, or emulated on a host.

use tracing::{debug, info};

use crate::arena::BootArena;
use crate::di::DiscDrive;
use crate::disc::{ApploaderHeader, APPLOADER_HEADER_SIZE, APPLOADER_OFFSET};
use crate::error::{BootError, BootResult};
use crate::ios::IosTransport;
use crate::memory::MainMemory;
use crate::platform::CacheControl;

/// Where the apploader payload is copied.
pub const APPLOADER_PAYLOAD_ADDR: u32 = 0x8120_0000;

/// One transfer requested by the apploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub destination: u32,
    pub size: u32,
    /// In 4-byte units, relative to the partition.
    pub source_words: u32,
}

impl Segment {
    pub fn source_offset(&self) -> u64 {
        (self.source_words as u64) << 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    More(Segment),
    Done,
}

/// The capability set returned by the start routine.
pub trait ApploaderCallbacks {
    /// Route the apploader's progress text somewhere. Best effort.
    fn enable_reporting(&mut self);

    /// Ask for the next segment. Memory holds every earlier segment.
    fn load_next(&mut self, memory: &mut dyn MainMemory) -> LoadStep;

    /// Entry point of the loaded executable.
    fn exit(&mut self, memory: &mut dyn MainMemory) -> u32;
}

pub trait ApploaderRuntime {
    type Callbacks: ApploaderCallbacks;

    /// Invoke the start routine of the payload already in memory. Called
    /// once per attempt.
    fn start(&mut self, header: &ApploaderHeader, memory: &mut dyn MainMemory) -> BootResult<Self::Callbacks>;
}

/// Read the header and payload, then start the apploader.
pub fn load<T, R>(
    drive: &DiscDrive<T>,
    arena: &mut BootArena,
    memory: &mut dyn MainMemory,
    cache: &dyn CacheControl,
    runtime: &mut R,
    report: bool,
) -> BootResult<(ApploaderHeader, R::Callbacks)>
where
    T: IosTransport,
    R: ApploaderRuntime,
{
    let raw = &mut arena.apploader_header[..];
    drive.read(raw, APPLOADER_OFFSET)?;
    cache.flush_range(raw);
    let header = ApploaderHeader::parse(raw)?;
    if header.entry_point == 0 {
        return Err(BootError::InvalidApploader("null entry point".to_string()));
    }

    let len = header.payload_len()?;
    debug!(
        revision = %header.revision(),
        entry = format_args!("{:#010x}", header.entry_point),
        size = header.size,
        trailer = header.trailer_size,
        "apploader header"
    );

    let payload = memory.region_mut(APPLOADER_PAYLOAD_ADDR, len as usize)?;
    drive.read(payload, APPLOADER_OFFSET + APPLOADER_HEADER_SIZE as u64)?;
    cache.flush_range(payload);

    let mut callbacks = runtime.start(&header, memory)?;
    if report {
        callbacks.enable_reporting();
    }
    info!(revision = %header.revision(), len, "apploader started");
    Ok((header, callbacks))
}
