// segments.rs
//! Segment copy loop.
//!
//! Asks the apploader for segments until it says it is done, copying each
//! one from disc straight to its destination and running the patch scanners
//! over it.

use std::time::Instant;

use tracing::{debug, info};

use crate::apploader::{ApploaderCallbacks, LoadStep, Segment};
use crate::di::DiscDrive;
use crate::error::{BootError, BootResult};
use crate::ios::IosTransport;
use crate::memory::MainMemory;
use crate::metrics::BootMetrics;
use crate::patches::PatchSet;
use crate::platform::CacheControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub segments: u32,
    pub bytes: u64,
}

pub struct SegmentLoader<'a, T: IosTransport> {
    drive: &'a DiscDrive<T>,
    cache: &'a dyn CacheControl,
    metrics: &'a BootMetrics,
    state: LoadState,
    summary: LoadSummary,
}

impl<'a, T: IosTransport> SegmentLoader<'a, T> {
    pub fn new(drive: &'a DiscDrive<T>, cache: &'a dyn CacheControl, metrics: &'a BootMetrics) -> Self {
        Self { drive, cache, metrics, state: LoadState::Loading, summary: LoadSummary::default() }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn summary(&self) -> LoadSummary {
        self.summary
    }

    /// One round of the protocol.
    pub fn step<C: ApploaderCallbacks>(
        &mut self,
        callbacks: &mut C,
        memory: &mut dyn MainMemory,
        patches: &mut PatchSet,
    ) -> BootResult<LoadState> {
        if self.state == LoadState::Done {
            return Ok(LoadState::Done);
        }
        match callbacks.load_next(memory) {
            LoadStep::Done => self.state = LoadState::Done,
            LoadStep::More(segment) => self.copy(segment, memory, patches)?,
        }
        Ok(self.state)
    }

    pub fn run<C: ApploaderCallbacks>(
        mut self,
        callbacks: &mut C,
        memory: &mut dyn MainMemory,
        patches: &mut PatchSet,
    ) -> BootResult<LoadSummary> {
        let started = Instant::now();
        while self.step(callbacks, memory, patches)? == LoadState::Loading {}
        self.metrics.record_load_time(started.elapsed());
        info!(
            segments = self.summary.segments,
            bytes = self.summary.bytes,
            elapsed = ?started.elapsed(),
            "apploader finished"
        );
        Ok(self.summary)
    }

    fn copy(&mut self, segment: Segment, memory: &mut dyn MainMemory, patches: &mut PatchSet) -> BootResult<()> {
        if segment.destination == 0 {
            return Err(BootError::NullSegment { size: segment.size, source: segment.source_words });
        }
        debug!(
            dest = format_args!("{:#010x}", segment.destination),
            size = segment.size,
            offset = segment.source_offset(),
            "segment"
        );
        if segment.size == 0 {
            return Ok(());
        }

        let dest = memory.region_mut(segment.destination, segment.size as usize)?;
        self.drive.read(dest, segment.source_offset())?;
        self.cache.flush_range(dest);
        patches.scan(dest, segment.destination, self.metrics);

        self.summary.segments += 1;
        self.summary.bytes += segment.size as u64;
        self.metrics.record_segment();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemory;
    use crate::patches::PatchOptions;
    use crate::testutil::{open_partition_drive, DiscBuilder, NullCache};
    use crate::video::VideoMode;
    use crate::disc::DiscRegion;
    use std::collections::VecDeque;

    /// Plays back a fixed script of callback results.
    struct Scripted {
        steps: VecDeque<LoadStep>,
        calls: usize,
    }

    impl Scripted {
        fn new(steps: &[LoadStep]) -> Self {
            Self { steps: steps.iter().copied().collect(), calls: 0 }
        }
    }

    impl ApploaderCallbacks for Scripted {
        fn enable_reporting(&mut self) {}

        fn load_next(&mut self, _memory: &mut dyn MainMemory) -> LoadStep {
            self.calls += 1;
            self.steps.pop_front().unwrap_or(LoadStep::Done)
        }

        fn exit(&mut self, _memory: &mut dyn MainMemory) -> u32 {
            0x8000_3400
        }
    }

    fn no_patches() -> PatchSet {
        PatchSet::new(&PatchOptions::default(), VideoMode::Ntsc, DiscRegion::from_code(b'E'))
    }

    #[test]
    fn test_single_segment_then_done() {
        let image = DiscBuilder::bootable().counting_pattern_in_partition(0x8000, 0x8100).build();
        let drive = open_partition_drive(image);
        let metrics = BootMetrics::new();
        let mut memory = GuestMemory::new().unwrap();

        let segment = Segment { destination: 0x8000_4000, size: 0x100, source_words: 0x8000 >> 2 };
        let mut script = Scripted::new(&[LoadStep::More(segment), LoadStep::Done]);
        let mut patches = no_patches();

        let loader = SegmentLoader::new(&drive, &NullCache, &metrics);
        let summary = loader.run(&mut script, &mut memory, &mut patches).unwrap();
        assert_eq!(summary, LoadSummary { segments: 1, bytes: 0x100 });
        assert_eq!(script.calls, 2);
        assert_eq!(memory.read_u32(0x8000_4000).unwrap(), 0x8000);
        assert_eq!(memory.read_u32(0x8000_40FC).unwrap(), 0x80FC);
        assert_eq!(memory.read_u32(0x8000_4100).unwrap(), 0);
    }

    #[test]
    fn test_null_destination_is_fatal() {
        let drive = open_partition_drive(DiscBuilder::bootable().build());
        let metrics = BootMetrics::new();
        let mut memory = GuestMemory::new().unwrap();
        let bad = Segment { destination: 0, size: 0x20, source_words: 0x100 };
        let mut script = Scripted::new(&[LoadStep::More(bad)]);
        let mut patches = no_patches();

        let mut loader = SegmentLoader::new(&drive, &NullCache, &metrics);
        let err = loader.step(&mut script, &mut memory, &mut patches).unwrap_err();
        assert!(matches!(err, BootError::NullSegment { size: 0x20, source: 0x100 }));
        assert_eq!(loader.state(), LoadState::Loading);
    }

    #[test]
    fn test_done_is_terminal() {
        let drive = open_partition_drive(DiscBuilder::bootable().build());
        let metrics = BootMetrics::new();
        let mut memory = GuestMemory::new().unwrap();
        let mut script = Scripted::new(&[]);
        let mut patches = no_patches();

        let mut loader = SegmentLoader::new(&drive, &NullCache, &metrics);
        assert_eq!(loader.step(&mut script, &mut memory, &mut patches).unwrap(), LoadState::Done);
        assert_eq!(loader.step(&mut script, &mut memory, &mut patches).unwrap(), LoadState::Done);
        assert_eq!(script.calls, 1);
    }
}
