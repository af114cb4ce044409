// testutil.rs
//! Disc images and platform doubles shared by the unit tests.

use std::collections::VecDeque;
use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use crate::arena::BootArena;
use crate::channel::CommandChannel;
use crate::di::DiscDrive;
use crate::disc::DISC_MAGIC;
use crate::image_drive::ImageDrive;
use crate::metrics::BootMetrics;
use crate::patches::render_mode_prefix;
use crate::platform::{CacheControl, Console, Display, Input, Logger, Platform, Storage};
use crate::video::VideoMode;

pub type TestDrive = DiscDrive<ImageDrive<Cursor<Vec<u8>>>>;

pub const PARTITION_OFFSET: u64 = 0x50000;
pub const PARTITION_WORDS: u32 = (PARTITION_OFFSET >> 2) as u32;
/// Partition-relative start of the data area.
pub const DATA_OFFSET: usize = 0x20000;
const DATA: usize = PARTITION_OFFSET as usize + DATA_OFFSET;

pub const TMD_SIZE: u32 = 0x208;
pub const REQUESTED_IOS: u8 = 36;

/// First bytes of the apploader payload.
pub const APPLOADER_STAMP: [u8; 4] = *b"APLD";
pub const APPLOADER_ENTRY: u32 = 0x8120_0000;

pub const DOL_OFFSET: usize = 0x10000;
pub const FST_OFFSET: usize = 0x20000;
pub const FST_SIZE: usize = 0x100;

pub const TEXT_ADDR: u32 = 0x8000_4000;
pub const DATA_ADDR: u32 = 0x8000_5000;
pub const BSS_ADDR: u32 = 0x8000_6000;
pub const ENTRY_POINT: u32 = 0x8000_4000;

/// Code carrying both the language load and the error 002 check.
pub const TEXT_WORDS: [u32; 8] = [
    0x7C60_0775,
    0x4082_0010,
    0x3800_0000,
    0x6000_0000,
    0x8861_0008,
    0x2C00_0000,
    0x4082_0214,
    0x3C60_8000,
];

pub struct DiscBuilder {
    image: Vec<u8>,
}

impl DiscBuilder {
    /// A bare disc header with no partitions.
    pub fn new() -> Self {
        let mut builder = Self { image: vec![0u8; 0x50000] };
        builder.put(0, b"RSPE01");
        builder.put_word(0x18, DISC_MAGIC);
        builder.put(0x20, b"SoftChip Test Disc");
        builder
    }

    /// One data partition with a ticket, TMD, apploader, DOL and FST.
    pub fn bootable() -> Self {
        let p = PARTITION_OFFSET as usize;
        let mut builder = Self::new().partitions(&[(PARTITION_WORDS, 0)]);

        // ticket signature type, then the partition header fields
        builder.put_word(p, 0x0001_0001);
        builder.put_word(p + 0x2A4, TMD_SIZE);
        builder.put_word(p + 0x2A8, 0x2C0 >> 2);
        builder.put_word(p + 0x2AC, 0xA00);
        builder.put_word(p + 0x2B0, 0x4E0 >> 2);
        builder.put_word(p + 0x2B8, (DATA_OFFSET >> 2) as u32);
        builder.put_word(p + 0x2BC, (0x20200 >> 2) as u32);

        builder.put_word(p + 0x2C0, 0x0001_0001);
        builder.put(p + 0x2C0 + 0x18B, &[REQUESTED_IOS]);

        // boot block
        builder.put(DATA, b"RSPE01");
        builder.put_word(DATA + 0x18, DISC_MAGIC);
        builder.put_word(DATA + 0x420, (DOL_OFFSET >> 2) as u32);
        builder.put_word(DATA + 0x424, (FST_OFFSET >> 2) as u32);
        builder.put_word(DATA + 0x428, (FST_SIZE >> 2) as u32);
        builder.put_word(DATA + 0x42C, (FST_SIZE >> 2) as u32);

        builder = builder.apploader(0x1000, 0);

        // DOL: one text and one data section
        let dol = DATA + DOL_OFFSET;
        builder.put_word(dol, 0x100);
        builder.put_word(dol + 0x48, TEXT_ADDR);
        builder.put_word(dol + 0x90, 0x100);
        builder.put_word(dol + 0x1C, 0x200);
        builder.put_word(dol + 0x64, DATA_ADDR);
        builder.put_word(dol + 0xAC, 0x40);
        builder.put_word(dol + 0xD8, BSS_ADDR);
        builder.put_word(dol + 0xDC, 0x100);
        builder.put_word(dol + 0xE0, ENTRY_POINT);
        for (i, word) in TEXT_WORDS.iter().enumerate() {
            builder.put_word(dol + 0x100 + i * 4, *word);
        }
        builder.put(dol + 0x200, &[0x00, b'J', b'P', 0]);
        builder.put(dol + 0x204, &[0x01, b'U', b'S', 0]);
        builder.put(dol + 0x208, &render_mode_prefix(VideoMode::Ntsc));

        // FST root entry
        let fst = DATA + FST_OFFSET;
        builder.put_word(fst, 0x0100_0000);
        builder.put_word(fst + 8, 1);
        builder.put(fst + FST_SIZE - 4, &[0, 0, 0, 0]);
        builder
    }

    /// Descriptor group 0 followed by the given `(offset_words, kind)` entries.
    pub fn partitions(self, entries: &[(u32, u32)]) -> Self {
        let mut builder = self.descriptor(entries.len() as u32, 0x40020 >> 2);
        for (i, (offset, kind)) in entries.iter().enumerate() {
            builder.put_word(0x40020 + i * 8, *offset);
            builder.put_word(0x40024 + i * 8, *kind);
        }
        builder
    }

    pub fn descriptor(mut self, count: u32, offset_words: u32) -> Self {
        self.put_word(0x40000, count);
        self.put_word(0x40004, offset_words);
        self
    }

    pub fn apploader(mut self, size: u32, trailer: u32) -> Self {
        let at = DATA + 0x2440;
        self.put(at, b"2008/05/19\0\0\0\0\0\0");
        self.put_word(at + 0x10, APPLOADER_ENTRY);
        self.put_word(at + 0x14, size);
        self.put_word(at + 0x18, trailer);
        let payload = at + 0x20;
        self.put(payload, &APPLOADER_STAMP);
        self.grow(payload + size as usize + trailer as usize);
        self
    }

    /// Every word holds its own image offset.
    pub fn counting_pattern(mut self, start: usize, end: usize) -> Self {
        for at in (start..end).step_by(4) {
            self.put_word(at, at as u32);
        }
        self
    }

    /// Same as [`Self::counting_pattern`], relative to the partition data.
    pub fn counting_pattern_in_partition(mut self, start: usize, end: usize) -> Self {
        for at in (start..end).step_by(4) {
            self.put_word(DATA + at, at as u32);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.image
    }

    fn grow(&mut self, len: usize) {
        if self.image.len() < len {
            self.image.resize(len, 0);
        }
    }

    fn put(&mut self, at: usize, bytes: &[u8]) {
        self.grow(at + bytes.len());
        self.image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn put_word(&mut self, at: usize, value: u32) {
        self.put(at, &value.to_be_bytes());
    }
}

pub fn drive_for(image: Vec<u8>) -> TestDrive {
    let transport = ImageDrive::new(Cursor::new(image)).expect("in-memory image");
    DiscDrive::new(Arc::new(CommandChannel::new(transport, Arc::new(BootMetrics::new()))))
}

/// A drive with the boot partition of `image` already open.
pub fn open_partition_drive(image: Vec<u8>) -> TestDrive {
    let drive = drive_for(image);
    drive.initialize().unwrap();
    drive.set_offset_base(PARTITION_OFFSET).unwrap();
    let mut arena = BootArena::new();
    drive.open_partition(PARTITION_WORDS, None, None, &mut arena.tmd[..]).unwrap();
    drive
}

// ============================================================================
// PLATFORM DOUBLES
// ============================================================================

pub struct NullCache;

impl CacheControl for NullCache {
    fn flush_range(&self, _data: &[u8]) {}
}

/// Everything the doubles were asked to do, in order.
pub type Transcript = Arc<Mutex<Vec<String>>>;

fn note(transcript: &Transcript, line: String) {
    transcript.lock().unwrap().push(line);
}

struct RecordingConsole {
    transcript: Transcript,
    silent: bool,
}

impl Console for RecordingConsole {
    fn print(&mut self, args: fmt::Arguments<'_>) {
        if !self.silent {
            note(&self.transcript, format!("console: {}", args));
        }
    }

    fn print_err(&mut self, args: fmt::Arguments<'_>) {
        note(&self.transcript, format!("error: {}", args));
    }

    fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }
}

struct RecordingLogger(Transcript);

impl Logger for RecordingLogger {
    fn open(&mut self) {
        note(&self.0, "log open".to_string());
    }

    fn write(&mut self, args: fmt::Arguments<'_>) {
        note(&self.0, format!("log: {}", args));
    }

    fn close(&mut self) {
        note(&self.0, "log close".to_string());
    }
}

struct RecordingStorage(Transcript);

impl Storage for RecordingStorage {
    fn initialize(&mut self) -> bool {
        note(&self.0, "storage init".to_string());
        true
    }

    fn release(&mut self) {
        note(&self.0, "storage release".to_string());
    }
}

/// Answers prompts from a script; an exhausted script asks to quit.
struct ScriptedInput {
    transcript: Transcript,
    answers: VecDeque<bool>,
}

impl Input for ScriptedInput {
    fn wait_any_key(&mut self, prompt: &str) -> bool {
        note(&self.transcript, format!("prompt: {}", prompt));
        self.answers.pop_front().unwrap_or(false)
    }
}

struct RecordingDisplay(Transcript);

impl Display for RecordingDisplay {
    fn configure(&mut self, mode: VideoMode) {
        note(&self.0, format!("video {}", mode));
    }
}

pub fn test_platform(answers: &[bool]) -> (Platform, Transcript) {
    let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));
    let platform = Platform {
        console: Box::new(RecordingConsole { transcript: Arc::clone(&transcript), silent: false }),
        logger: Box::new(RecordingLogger(Arc::clone(&transcript))),
        storage: Box::new(RecordingStorage(Arc::clone(&transcript))),
        input: Box::new(ScriptedInput {
            transcript: Arc::clone(&transcript),
            answers: answers.iter().copied().collect(),
        }),
        display: Box::new(RecordingDisplay(Arc::clone(&transcript))),
        cache: Box::new(NullCache),
    };
    (platform, transcript)
}
