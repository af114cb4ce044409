// disc.rs
//! On-disc structures. All fields are big-endian.

use std::fmt;

use crate::error::{BootError, BootResult};

pub const DISC_MAGIC: u32 = 0x5D1C_9EA3;
pub const HEADER_SIZE: usize = 0x800;
pub const TITLE_OFFSET: usize = 0x20;
pub const TITLE_LEN: usize = 60;

pub const DESCRIPTOR_OFFSET: u64 = 0x40000;
pub const DESCRIPTOR_SIZE: usize = 0x20;
pub const PARTITION_GROUPS: usize = 4;
pub const PARTITION_INFO_SIZE: usize = 8;

/// Partition-relative location of the apploader header.
pub const APPLOADER_OFFSET: u64 = 0x2440;
pub const APPLOADER_HEADER_SIZE: usize = 0x20;

/// Leading words that mark a decrypted dump.
const DECRYPTED_MARKERS: [u32; 2] = [0x10000, 0x10001];

pub(crate) fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn require(bytes: &[u8], len: usize, what: &'static str) -> BootResult<()> {
    if bytes.len() < len {
        return Err(BootError::Truncated { what, needed: len, available: bytes.len() });
    }
    Ok(())
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// ============================================================================
// REGION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscRegion {
    Japan,
    Usa,
    Europe(u8),
    Korea,
    Other(u8),
}

impl DiscRegion {
    pub fn from_code(code: u8) -> Self {
        match code {
            b'J' => Self::Japan,
            b'E' => Self::Usa,
            b'D' | b'F' | b'P' | b'X' | b'Y' => Self::Europe(code),
            b'K' => Self::Korea,
            other => Self::Other(other),
        }
    }

    pub fn is_pal(self) -> bool {
        matches!(self, Self::Europe(_))
    }

    /// Two-letter code the game's country strings use.
    pub fn country_code(self) -> [u8; 2] {
        match self {
            Self::Japan => *b"JP",
            Self::Europe(_) => *b"EU",
            Self::Korea => *b"KR",
            Self::Usa | Self::Other(_) => *b"US",
        }
    }
}

// ============================================================================
// DISC IDENTITY
// ============================================================================

/// The 32 bytes returned by `ReadID` and mirrored at 0x80000000.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DiscIdentity {
    raw: [u8; 0x20],
}

impl DiscIdentity {
    pub fn parse(bytes: &[u8]) -> BootResult<Self> {
        require(bytes, 0x20, "disc identity")?;
        let mut raw = [0u8; 0x20];
        raw.copy_from_slice(&bytes[..0x20]);
        Ok(Self { raw })
    }

    pub fn leading_word(&self) -> u32 {
        be32(&self.raw, 0)
    }

    pub fn game_code(&self) -> [u8; 4] {
        [self.raw[0], self.raw[1], self.raw[2], self.raw[3]]
    }

    pub fn maker_code(&self) -> [u8; 2] {
        [self.raw[4], self.raw[5]]
    }

    pub fn disc_number(&self) -> u8 {
        self.raw[6]
    }

    pub fn version(&self) -> u8 {
        self.raw[7]
    }

    pub fn audio_streaming(&self) -> bool {
        self.raw[8] != 0
    }

    pub fn region(&self) -> DiscRegion {
        DiscRegion::from_code(self.raw[3])
    }

    pub fn is_decrypted(&self) -> bool {
        DECRYPTED_MARKERS.contains(&self.leading_word())
    }

    /// Reject media this loader cannot boot.
    pub fn check_media(&self) -> BootResult<()> {
        if self.is_decrypted() {
            return Err(BootError::DecryptedMedia(self.leading_word()));
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8; 0x20] {
        &self.raw
    }
}

impl fmt::Display for DiscIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.game_code().iter().chain(self.maker_code().iter()) {
            let c = if b.is_ascii_graphic() { *b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DiscIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscIdentity")
            .field("id", &self.to_string())
            .field("disc", &self.disc_number())
            .field("version", &self.version())
            .finish()
    }
}

// ============================================================================
// DISC HEADER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscHeader {
    pub game_code: [u8; 4],
    pub maker_code: [u8; 2],
    pub disc_number: u8,
    pub version: u8,
    pub audio_streaming: u8,
    pub stream_buffer_size: u8,
    pub magic: u32,
    pub title: String,
    pub disable_hash_verification: bool,
    pub disable_encryption: bool,
}

impl DiscHeader {
    pub fn parse(bytes: &[u8]) -> BootResult<Self> {
        require(bytes, 0x62, "disc header")?;
        Ok(Self {
            game_code: [bytes[0], bytes[1], bytes[2], bytes[3]],
            maker_code: [bytes[4], bytes[5]],
            disc_number: bytes[6],
            version: bytes[7],
            audio_streaming: bytes[8],
            stream_buffer_size: bytes[9],
            magic: be32(bytes, 0x18),
            title: c_str(&bytes[TITLE_OFFSET..TITLE_OFFSET + TITLE_LEN]),
            disable_hash_verification: bytes[0x60] != 0,
            disable_encryption: bytes[0x61] != 0,
        })
    }

    pub fn validate(&self) -> BootResult<()> {
        if self.magic != DISC_MAGIC {
            return Err(BootError::InvalidMagic(self.magic));
        }
        Ok(())
    }

    pub fn id_string(&self) -> String {
        let mut id = String::with_capacity(6);
        for b in self.game_code.iter().chain(self.maker_code.iter()) {
            id.push(if b.is_ascii_graphic() { *b as char } else { '.' });
        }
        id
    }
}

// ============================================================================
// PARTITION TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionGroup {
    pub count: u32,
    /// In 4-byte units.
    pub offset_words: u32,
}

impl PartitionGroup {
    pub fn byte_offset(&self) -> u64 {
        (self.offset_words as u64) << 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptorTable {
    pub groups: [PartitionGroup; PARTITION_GROUPS],
}

impl PartitionDescriptorTable {
    pub fn parse(bytes: &[u8]) -> BootResult<Self> {
        require(bytes, DESCRIPTOR_SIZE, "partition descriptor")?;
        let mut groups = [PartitionGroup::default(); PARTITION_GROUPS];
        for (i, group) in groups.iter_mut().enumerate() {
            group.count = be32(bytes, i * 8);
            group.offset_words = be32(bytes, i * 8 + 4);
        }
        Ok(Self { groups })
    }

    pub fn primary(&self) -> PartitionGroup {
        self.groups[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Data,
    Update,
    Channel,
    Other(u32),
}

impl From<u32> for PartitionKind {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Data,
            1 => Self::Update,
            2 => Self::Channel,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub offset_words: u32,
    pub kind: u32,
}

impl PartitionInfo {
    pub fn parse(entry: &[u8]) -> Self {
        Self { offset_words: be32(entry, 0), kind: be32(entry, 4) }
    }

    pub fn kind(&self) -> PartitionKind {
        PartitionKind::from(self.kind)
    }

    pub fn byte_offset(&self) -> u64 {
        (self.offset_words as u64) << 2
    }
}

// ============================================================================
// PARTITION HEADER
// ============================================================================

pub const PARTITION_HEADER_SIZE: usize = 0x800;

/// The fixed block at the start of every partition: the ticket followed by
/// the locations of the TMD, certificate chain, H3 table and data area.
/// Offsets are in 4-byte units relative to the partition start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    pub tmd_size: u32,
    pub tmd_offset_words: u32,
    pub cert_size: u32,
    pub cert_offset_words: u32,
    pub h3_offset_words: u32,
    pub data_offset_words: u32,
    pub data_size_words: u32,
}

impl PartitionHeader {
    pub fn parse(bytes: &[u8]) -> BootResult<Self> {
        require(bytes, 0x2C0, "partition header")?;
        Ok(Self {
            tmd_size: be32(bytes, 0x2A4),
            tmd_offset_words: be32(bytes, 0x2A8),
            cert_size: be32(bytes, 0x2AC),
            cert_offset_words: be32(bytes, 0x2B0),
            h3_offset_words: be32(bytes, 0x2B4),
            data_offset_words: be32(bytes, 0x2B8),
            data_size_words: be32(bytes, 0x2BC),
        })
    }

    pub fn tmd_offset(&self) -> u64 {
        (self.tmd_offset_words as u64) << 2
    }

    pub fn data_offset(&self) -> u64 {
        (self.data_offset_words as u64) << 2
    }
}

// ============================================================================
// APPLOADER HEADER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApploaderHeader {
    pub revision: [u8; 16],
    pub entry_point: u32,
    pub size: u32,
    pub trailer_size: u32,
}

impl ApploaderHeader {
    pub fn parse(bytes: &[u8]) -> BootResult<Self> {
        require(bytes, APPLOADER_HEADER_SIZE, "apploader header")?;
        let mut revision = [0u8; 16];
        revision.copy_from_slice(&bytes[..16]);
        Ok(Self {
            revision,
            entry_point: be32(bytes, 0x10),
            size: be32(bytes, 0x14),
            trailer_size: be32(bytes, 0x18),
        })
    }

    pub fn revision(&self) -> String {
        c_str(&self.revision)
    }

    /// Bytes that follow the header on disc.
    pub fn payload_len(&self) -> BootResult<u32> {
        self.size
            .checked_add(self.trailer_size)
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                BootError::InvalidApploader(format!(
                    "payload size {:#x} + trailer {:#x}",
                    self.size, self.trailer_size
                ))
            })
    }
}
