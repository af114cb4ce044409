// patches.rs
//! Binary patch scanners run over every freshly loaded segment.
//!
//! Code and data are big-endian PowerPC words. Each scanner remembers when
//! it has succeeded and reports that only once; later segments are skipped.

use clap::ValueEnum;
use tracing::{info, warn};

use crate::disc::DiscRegion;
use crate::metrics::BootMetrics;
use crate::video::VideoMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The target was found and rewritten.
    Patched,
    /// A read-only check found its target.
    Verified,
    NotFound,
    /// Nothing left to do, the image already carries the change.
    AlreadyPatched,
}

impl ScanOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

pub trait PatchScanner {
    fn name(&self) -> &'static str;

    fn scan(&mut self, image: &mut [u8]) -> ScanOutcome;

    fn is_done(&self) -> bool;
}

fn word_at(image: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]])
}

fn put_word(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn words_match(image: &[u8], at: usize, pattern: &[u32]) -> bool {
    at + pattern.len() * 4 <= image.len()
        && pattern
            .iter()
            .enumerate()
            .all(|(i, w)| word_at(image, at + i * 4) == *w)
}

// ============================================================================
// LANGUAGE
// ============================================================================

const LANGUAGE_SIGNATURE: [u32; 3] = [0x7C60_0775, 0x4082_0010, 0x3800_0000];
/// `lbz r3, 8(r1)`: loads the system language.
const LANGUAGE_LOAD: u32 = 0x8861_0008;
/// `li r3, 0`
const LANGUAGE_IMMEDIATE: u32 = 0x3860_0000;

/// Forces the language the game reads from the system settings.
pub struct LanguagePatch {
    language: u8,
    done: bool,
}

impl LanguagePatch {
    pub fn new(language: u8) -> Self {
        Self { language, done: false }
    }
}

impl PatchScanner for LanguagePatch {
    fn name(&self) -> &'static str {
        "language"
    }

    fn scan(&mut self, image: &mut [u8]) -> ScanOutcome {
        if self.done {
            return ScanOutcome::AlreadyPatched;
        }
        let mut armed = false;
        let mut at = 0;
        while at + 4 <= image.len() {
            if armed {
                if word_at(image, at) == LANGUAGE_LOAD {
                    put_word(image, at, LANGUAGE_IMMEDIATE | self.language as u32);
                    self.done = true;
                    return ScanOutcome::Patched;
                }
            } else if words_match(image, at, &LANGUAGE_SIGNATURE) {
                armed = true;
            }
            at += 4;
        }
        ScanOutcome::NotFound
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ============================================================================
// ERROR 002
// ============================================================================

const CHECK_002: [u32; 3] = [0x2C00_0000, 0x4082_0214, 0x3C60_8000];
const CHECK_002_REMOVED: [u32; 3] = [0x2C00_0000, 0x4800_0214, 0x3C60_8000];

/// Turns the conditional branch into the error 002 path unconditional.
#[derive(Default)]
pub struct Remove002 {
    done: bool,
}

impl Remove002 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatchScanner for Remove002 {
    fn name(&self) -> &'static str {
        "002 removal"
    }

    fn scan(&mut self, image: &mut [u8]) -> ScanOutcome {
        if self.done {
            return ScanOutcome::AlreadyPatched;
        }
        let mut at = 0;
        while at + 12 <= image.len() {
            if words_match(image, at, &CHECK_002) {
                put_word(image, at + 4, CHECK_002_REMOVED[1]);
                self.done = true;
                return ScanOutcome::Patched;
            }
            if words_match(image, at, &CHECK_002_REMOVED) {
                self.done = true;
                return ScanOutcome::AlreadyPatched;
            }
            at += 4;
        }
        ScanOutcome::NotFound
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ============================================================================
// COUNTRY STRINGS
// ============================================================================

/// Console region as stored in the system settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConsoleRegion {
    Japan,
    Usa,
    Europe,
    Korea,
    China,
}

impl ConsoleRegion {
    /// Record tag and country letters as they appear in game data.
    pub fn record(self) -> [u8; 3] {
        match self {
            Self::Japan => [0x00, b'J', b'P'],
            Self::Usa => [0x01, b'U', b'S'],
            Self::Europe => [0x02, b'E', b'U'],
            Self::Korea => [0x04, b'K', b'R'],
            Self::China => [0x05, b'C', b'N'],
        }
    }
}

/// Rewrites `[tag, c0, c1, 0]` records of the console region with the
/// disc region's letters.
pub struct CountryStrings {
    search: [u8; 3],
    replace: [u8; 2],
    done: bool,
}

impl CountryStrings {
    /// `None` when the console already matches the disc.
    pub fn new(console: ConsoleRegion, disc: DiscRegion) -> Option<Self> {
        let search = console.record();
        let replace = disc.country_code();
        if search[1..] == replace[..] {
            return None;
        }
        Some(Self { search, replace, done: false })
    }
}

impl PatchScanner for CountryStrings {
    fn name(&self) -> &'static str {
        "country strings"
    }

    fn scan(&mut self, image: &mut [u8]) -> ScanOutcome {
        if self.done {
            return ScanOutcome::AlreadyPatched;
        }
        let patched_record = [self.search[0], self.replace[0], self.replace[1], 0];
        let mut rewritten = 0usize;
        let mut seen_patched = false;

        for record in image.chunks_exact_mut(4) {
            if record[..3] == self.search[..] && record[3] == 0 {
                record[1] = self.replace[0];
                record[2] = self.replace[1];
                rewritten += 1;
            } else if *record == patched_record {
                seen_patched = true;
            }
        }

        if rewritten > 0 {
            self.done = true;
            ScanOutcome::Patched
        } else if seen_patched {
            self.done = true;
            ScanOutcome::AlreadyPatched
        } else {
            ScanOutcome::NotFound
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ============================================================================
// VIDEO MODE CHECK
// ============================================================================

/// Render mode prefix: tv mode, fb width, efb height, xfb height, x origin,
/// y origin, vi width, vi height.
pub(crate) fn render_mode_prefix(mode: VideoMode) -> [u8; 18] {
    let (tv_mode, efb, xfb, y_origin, vi_height): (u32, u16, u16, u16, u16) = match mode {
        VideoMode::Ntsc => (0, 480, 480, 0, 480),
        VideoMode::Pal => (4, 528, 528, 23, 528),
        VideoMode::Mpal => (8, 480, 480, 0, 480),
        VideoMode::Pal60 => (20, 480, 480, 0, 480),
    };
    let mut prefix = [0u8; 18];
    prefix[..4].copy_from_slice(&tv_mode.to_be_bytes());
    let halves = [640u16, efb, xfb, 40, y_origin, 640, vi_height];
    for (i, half) in halves.iter().enumerate() {
        prefix[4 + i * 2..6 + i * 2].copy_from_slice(&half.to_be_bytes());
    }
    prefix
}

/// Confirms that the image carries a render mode table for the chosen
/// video mode. Never writes.
pub struct VideoModeCheck {
    mode: VideoMode,
    prefix: [u8; 18],
    found: bool,
}

impl VideoModeCheck {
    pub fn new(mode: VideoMode) -> Self {
        Self { mode, prefix: render_mode_prefix(mode), found: false }
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }
}

impl PatchScanner for VideoModeCheck {
    fn name(&self) -> &'static str {
        "video mode check"
    }

    fn scan(&mut self, image: &mut [u8]) -> ScanOutcome {
        if self.found {
            return ScanOutcome::AlreadyPatched;
        }
        let len = self.prefix.len();
        let mut at = 0;
        while at + len <= image.len() {
            if image[at..at + len] == self.prefix {
                self.found = true;
                return ScanOutcome::Verified;
            }
            at += 4;
        }
        ScanOutcome::NotFound
    }

    fn is_done(&self) -> bool {
        self.found
    }
}

// ============================================================================
// PATCH SET
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchOptions {
    pub language: Option<u8>,
    pub remove_002: bool,
    pub country_strings: Option<ConsoleRegion>,
    pub verify_video: bool,
}

/// The scanners enabled for one attempt.
pub struct PatchSet {
    scanners: Vec<Box<dyn PatchScanner>>,
}

impl PatchSet {
    pub fn new(options: &PatchOptions, video: VideoMode, region: DiscRegion) -> Self {
        let mut scanners: Vec<Box<dyn PatchScanner>> = Vec::with_capacity(4);
        if let Some(language) = options.language {
            scanners.push(Box::new(LanguagePatch::new(language)));
        }
        if options.remove_002 {
            scanners.push(Box::new(Remove002::new()));
        }
        if let Some(console) = options.country_strings {
            if let Some(scanner) = CountryStrings::new(console, region) {
                scanners.push(Box::new(scanner));
            }
        }
        if options.verify_video {
            scanners.push(Box::new(VideoModeCheck::new(video)));
        }
        Self { scanners }
    }

    pub fn len(&self) -> usize {
        self.scanners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Run every pending scanner over `image`.
    pub fn scan(&mut self, image: &mut [u8], addr: u32, metrics: &BootMetrics) {
        for scanner in self.scanners.iter_mut().filter(|s| !s.is_done()) {
            match scanner.scan(image) {
                ScanOutcome::Patched => {
                    metrics.record_patch();
                    info!(patch = scanner.name(), segment = format_args!("{:#010x}", addr), "patch applied");
                }
                ScanOutcome::Verified | ScanOutcome::AlreadyPatched => {
                    info!(patch = scanner.name(), segment = format_args!("{:#010x}", addr), "target present");
                }
                ScanOutcome::NotFound => {}
            }
        }
    }

    /// Names of scanners that never found their target.
    pub fn missing(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.scanners.iter().filter(|s| !s.is_done()).map(|s| s.name())
    }

    pub fn report_missing(&self) {
        for name in self.missing() {
            warn!(patch = name, "target not found in any segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    fn words(image: &[u8]) -> Vec<u32> {
        image.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn test_language_patch_rewrites_target_once() {
        let mut buf = image(&[
            0x6000_0000,
            0x7C60_0775,
            0x4082_0010,
            0x3800_0000,
            0x6000_0000,
            0x8861_0008,
            0x8861_0008,
        ]);
        let mut scanner = LanguagePatch::new(3);
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::Patched);
        let patched = words(&buf);
        assert_eq!(patched[5], 0x3860_0003);
        assert_eq!(patched[6], 0x8861_0008);

        let snapshot = buf.clone();
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_language_target_before_signature_ignored() {
        let mut buf = image(&[0x8861_0008, 0x7C60_0775, 0x4082_0010, 0x3800_0000, 0x6000_0000]);
        let mut scanner = LanguagePatch::new(1);
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::NotFound);
        assert_eq!(words(&buf)[0], 0x8861_0008);
        assert!(!scanner.is_done());
    }

    #[test]
    fn test_remove_002_idempotent() {
        let mut buf = image(&[0x6000_0000, 0x2C00_0000, 0x4082_0214, 0x3C60_8000]);
        let mut scanner = Remove002::new();
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::Patched);
        assert_eq!(words(&buf)[2], 0x4800_0214);

        let snapshot = buf.clone();
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);

        let mut fresh = Remove002::new();
        assert_eq!(fresh.scan(&mut buf), ScanOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_country_strings_rewrite_all_records() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x01, b'U', b'S', 0]);
        buf.extend_from_slice(&[0x00, b'J', b'P', 0]);
        buf.extend_from_slice(&[0x01, b'U', b'S', 0]);
        let mut scanner = CountryStrings::new(ConsoleRegion::Usa, DiscRegion::from_code(b'P')).unwrap();
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::Patched);
        assert_eq!(&buf[..4], &[0x01, b'E', b'U', 0]);
        assert_eq!(&buf[4..8], &[0x00, b'J', b'P', 0]);
        assert_eq!(&buf[8..], &[0x01, b'E', b'U', 0]);

        let snapshot = buf.clone();
        assert_eq!(scanner.scan(&mut buf), ScanOutcome::AlreadyPatched);
        let mut fresh = CountryStrings::new(ConsoleRegion::Usa, DiscRegion::from_code(b'P')).unwrap();
        assert_eq!(fresh.scan(&mut buf), ScanOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_country_strings_disabled_when_equal() {
        assert!(CountryStrings::new(ConsoleRegion::Europe, DiscRegion::from_code(b'D')).is_none());
        assert!(CountryStrings::new(ConsoleRegion::Usa, DiscRegion::from_code(b'E')).is_none());
        assert!(CountryStrings::new(ConsoleRegion::Japan, DiscRegion::from_code(b'E')).is_some());
    }

    #[test]
    fn test_video_check_never_writes() {
        let mut buf = vec![0u8; 8];
        buf.extend_from_slice(&render_mode_prefix(VideoMode::Pal));
        buf.extend_from_slice(&[0u8; 6]);
        let snapshot = buf.clone();

        let mut ntsc = VideoModeCheck::new(VideoMode::Ntsc);
        assert_eq!(ntsc.scan(&mut buf), ScanOutcome::NotFound);
        let mut pal = VideoModeCheck::new(VideoMode::Pal);
        assert_eq!(pal.scan(&mut buf), ScanOutcome::Verified);
        assert_eq!(pal.scan(&mut buf), ScanOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_render_mode_prefix_layout() {
        let pal = render_mode_prefix(VideoMode::Pal);
        assert_eq!(&pal[..4], &[0, 0, 0, 4]);
        assert_eq!(&pal[4..6], &640u16.to_be_bytes());
        assert_eq!(&pal[12..14], &23u16.to_be_bytes());
        assert_eq!(&render_mode_prefix(VideoMode::Pal60)[..4], &[0, 0, 0, 20]);
    }

    #[test]
    fn test_patch_set_tracks_missing() {
        let options = PatchOptions {
            language: Some(2),
            remove_002: true,
            country_strings: None,
            verify_video: false,
        };
        let mut set = PatchSet::new(&options, VideoMode::Ntsc, DiscRegion::from_code(b'E'));
        assert_eq!(set.len(), 2);

        let metrics = BootMetrics::new();
        let mut segment = image(&[0x2C00_0000, 0x4082_0214, 0x3C60_8000]);
        set.scan(&mut segment, 0x8000_4000, &metrics);
        assert_eq!(metrics.patches_applied(), 1);
        assert_eq!(set.missing().collect::<Vec<_>>(), vec!["language"]);

        let mut again = image(&[0x2C00_0000, 0x4082_0214, 0x3C60_8000]);
        set.scan(&mut again, 0x8000_5000, &metrics);
        assert_eq!(words(&again)[1], 0x4082_0214);
    }
}
