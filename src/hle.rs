// hle.rs
//! Host-side apploader.
//!
//! Walks the same steps a disc's apploader takes, without executing its
//! code: read the boot block, the DOL header, every DOL section and finally
//! the FST. Each step that needs earlier data reads it back from guest
//! memory, where the copy loop has put it.

use tracing::{debug, info, warn};

use crate::apploader::{ApploaderCallbacks, ApploaderRuntime, LoadStep, Segment};
use crate::disc::ApploaderHeader;
use crate::error::BootResult;
use crate::launch::{ARENA_HI_ADDR, FST_ADDR, FST_MAX_ADDR};
use crate::memory::MainMemory;

/// Scratch area for the boot block and DOL header.
pub const SCRATCH_ADDR: u32 = 0x8130_0000;
/// The FST is placed right below this address.
pub const FST_TOP: u32 = 0x8180_0000;

/// Partition offset of the boot block (DOL and FST locations).
const BOOT_INFO_OFFSET: u32 = 0x420;
const BOOT_INFO_SIZE: u32 = 0x20;
const DOL_HEADER_ADDR: u32 = SCRATCH_ADDR + BOOT_INFO_SIZE;
const DOL_HEADER_SIZE: u32 = 0x100;

const TEXT_SECTIONS: usize = 7;
const DATA_SECTIONS: usize = 11;
const SECTIONS: usize = TEXT_SECTIONS + DATA_SECTIONS;

fn word(memory: &dyn MainMemory, addr: u32) -> u32 {
    memory.read_u32(addr).unwrap_or(0)
}

// ============================================================================
// DOL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DolSection {
    pub offset: u32,
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DolLayout {
    pub sections: [DolSection; SECTIONS],
    pub bss_address: u32,
    pub bss_size: u32,
    pub entry: u32,
}

impl DolLayout {
    /// Decode the header the copy loop placed at `addr`.
    pub fn read(memory: &dyn MainMemory, addr: u32) -> Self {
        let mut layout = Self::default();
        for (i, section) in layout.sections.iter_mut().enumerate() {
            // text fields first, data fields follow each text block
            let slot = i as u32 * 4;
            section.offset = word(memory, addr + slot);
            section.address = word(memory, addr + 0x48 + slot);
            section.size = word(memory, addr + 0x90 + slot);
        }
        layout.bss_address = word(memory, addr + 0xD8);
        layout.bss_size = word(memory, addr + 0xDC);
        layout.entry = word(memory, addr + 0xE0);
        layout
    }
}

// ============================================================================
// CALLBACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BootInfo,
    DolHeader,
    Sections(usize),
    Finished,
}

pub struct HleCallbacks {
    stage: Stage,
    report: bool,
    dol_words: u32,
    fst_words: u32,
    fst_size: u32,
    fst_max: u32,
    dol: DolLayout,
}

impl HleCallbacks {
    fn new() -> Self {
        Self {
            stage: Stage::BootInfo,
            report: false,
            dol_words: 0,
            fst_words: 0,
            fst_size: 0,
            fst_max: 0,
            dol: DolLayout::default(),
        }
    }

    fn report(&self, what: &str, segment: &Segment) {
        if self.report {
            info!(
                target: "apploader",
                dest = format_args!("{:#010x}", segment.destination),
                size = segment.size,
                "{}",
                what
            );
        }
    }

    fn read_boot_info(&mut self, memory: &dyn MainMemory) {
        self.dol_words = word(memory, SCRATCH_ADDR);
        self.fst_words = word(memory, SCRATCH_ADDR + 4);
        self.fst_size = word(memory, SCRATCH_ADDR + 8) << 2;
        self.fst_max = word(memory, SCRATCH_ADDR + 12) << 2;
        debug!(
            dol = (self.dol_words as u64) << 2,
            fst = (self.fst_words as u64) << 2,
            fst_size = self.fst_size,
            "boot block"
        );
    }

    fn clear_bss(&self, memory: &mut dyn MainMemory) {
        if self.dol.bss_size == 0 {
            return;
        }
        match memory.region_mut(self.dol.bss_address, self.dol.bss_size as usize) {
            Ok(bss) => bss.fill(0),
            Err(err) => warn!(error = %err, "bss outside main memory"),
        }
    }

    fn next_section(&mut self, from: usize, memory: &mut dyn MainMemory) -> LoadStep {
        let Some(index) = (from..SECTIONS).find(|&i| self.dol.sections[i].size != 0) else {
            return self.fst(memory);
        };
        self.stage = Stage::Sections(index + 1);
        let section = self.dol.sections[index];
        let segment = if section.offset % 4 != 0 {
            warn!(index, offset = section.offset, "unaligned DOL section");
            Segment { destination: 0, size: section.size, source_words: 0 }
        } else {
            Segment {
                destination: section.address,
                size: section.size,
                source_words: self.dol_words + (section.offset >> 2),
            }
        };
        self.report(if index < TEXT_SECTIONS { "text" } else { "data" }, &segment);
        LoadStep::More(segment)
    }

    fn fst(&mut self, memory: &mut dyn MainMemory) -> LoadStep {
        self.stage = Stage::Finished;
        if self.fst_size == 0 {
            return LoadStep::Done;
        }
        let address = FST_TOP.wrapping_sub(self.fst_size) & !0x1F;
        let written = memory
            .write_u32(FST_ADDR, address)
            .and_then(|_| memory.write_u32(FST_MAX_ADDR, self.fst_max))
            .and_then(|_| memory.write_u32(ARENA_HI_ADDR, address));
        if let Err(err) = written {
            warn!(error = %err, "could not record the FST location");
        }
        let segment = Segment { destination: address, size: self.fst_size, source_words: self.fst_words };
        self.report("fst", &segment);
        LoadStep::More(segment)
    }
}

impl ApploaderCallbacks for HleCallbacks {
    fn enable_reporting(&mut self) {
        self.report = true;
    }

    fn load_next(&mut self, memory: &mut dyn MainMemory) -> LoadStep {
        match self.stage {
            Stage::BootInfo => {
                self.stage = Stage::DolHeader;
                LoadStep::More(Segment {
                    destination: SCRATCH_ADDR,
                    size: BOOT_INFO_SIZE,
                    source_words: BOOT_INFO_OFFSET >> 2,
                })
            }
            Stage::DolHeader => {
                self.read_boot_info(memory);
                self.stage = Stage::Sections(0);
                LoadStep::More(Segment {
                    destination: DOL_HEADER_ADDR,
                    size: DOL_HEADER_SIZE,
                    source_words: self.dol_words,
                })
            }
            Stage::Sections(0) => {
                self.dol = DolLayout::read(memory, DOL_HEADER_ADDR);
                debug!(entry = format_args!("{:#010x}", self.dol.entry), "dol header");
                self.clear_bss(memory);
                self.next_section(0, memory)
            }
            Stage::Sections(from) => self.next_section(from, memory),
            Stage::Finished => LoadStep::Done,
        }
    }

    fn exit(&mut self, _memory: &mut dyn MainMemory) -> u32 {
        self.dol.entry
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

#[derive(Debug, Default)]
pub struct HleApploader;

impl HleApploader {
    pub fn new() -> Self {
        Self
    }
}

impl ApploaderRuntime for HleApploader {
    type Callbacks = HleCallbacks;

    fn start(&mut self, header: &ApploaderHeader, _memory: &mut dyn MainMemory) -> BootResult<HleCallbacks> {
        debug!(revision = %header.revision(), "emulating apploader");
        Ok(HleCallbacks::new())
    }
}
