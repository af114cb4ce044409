// error.rs
//! Error taxonomy for the disc boot pipeline.
//!
//! Every fallible operation returns [`BootResult`]. Fatal conditions travel
//! with `?` up to the single recovery point in [`crate::boot::DiscBoot`];
//! soft conditions (a patch target that never shows up, a failed identify)
//! never become a `BootError` at all and are only logged.

use std::fmt;
use std::io;

use crate::channel::Ioctl;

// ============================================================================
// ERROR TYPE
// ============================================================================

#[derive(Debug)]
pub enum BootError {
    // Transport
    Protocol(Ioctl),
    Drive { command: Ioctl, code: i32 },
    DeviceOpen { path: &'static str, code: i32 },
    NotInitialized,
    IosReload { requested: u32, code: i32 },
    LockPoisoned(String),

    // Preconditions
    NullBuffer(Ioctl),
    Misaligned { command: Ioctl, addr: usize },
    BufferTooSmall { command: Ioctl, needed: usize, available: usize },
    InvalidOffset { command: Ioctl, offset: u64 },
    Truncated { what: &'static str, needed: usize, available: usize },
    DecryptedMedia(u32),
    InvalidMagic(u32),
    NoBootPartition,
    PartitionTableTooLarge { count: u32, capacity: usize },
    InvalidApploader(String),
    NullSegment { size: u32, source: u32 },
    NullEntryPoint,
    MemoryRange { addr: u32, len: usize },

    // Best-effort calls that callers may choose to surface
    Identify(i32),
    Credentials(i32),

    // Host
    MemoryAllocation(String),
    Io(io::Error),
    InvalidConfiguration(String),
}

/// Coarse grouping used by the recovery handler and by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The drive answered with the "command rejected" sentinel.
    Protocol,
    /// Detected before anything destructive happened.
    Precondition,
    /// A driver-level negative status.
    Drive,
    Diagnostic,
    Host,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(cmd) => write!(f, "Drive rejected {} (ioctl error)", cmd),
            Self::Drive { command, code } => write!(f, "{} failed with code {}", command, code),
            Self::DeviceOpen { path, code } => write!(f, "Could not open {}: {}", path, code),
            Self::NotInitialized => write!(f, "Disc interface is not initialized"),
            Self::IosReload { requested, code } => {
                write!(f, "Could not reload IOS {}: {}", requested, code)
            }
            Self::LockPoisoned(msg) => write!(f, "Lock poisoned: {}", msg),

            Self::NullBuffer(cmd) => write!(f, "{}: null or empty buffer", cmd),
            Self::Misaligned { command, addr } => {
                write!(f, "{}: buffer {:#x} is not 32-byte aligned", command, addr)
            }
            Self::BufferTooSmall { command, needed, available } => write!(
                f,
                "{}: buffer holds {:#x} bytes, {:#x} needed",
                command, available, needed
            ),
            Self::InvalidOffset { command, offset } => {
                write!(f, "{}: offset {:#x} is not addressable", command, offset)
            }
            Self::Truncated { what, needed, available } => {
                write!(f, "{} truncated: {:#x} of {:#x} bytes", what, available, needed)
            }
            Self::DecryptedMedia(word) => {
                write!(f, "Decrypted discs are not supported (id word {:#x})", word)
            }
            Self::InvalidMagic(magic) => write!(f, "Invalid disc magic {:#010x}", magic),
            Self::NoBootPartition => write!(f, "No boot partition found"),
            Self::PartitionTableTooLarge { count, capacity } => write!(
                f,
                "Partition table lists {} entries, at most {} supported",
                count, capacity
            ),
            Self::InvalidApploader(msg) => write!(f, "Invalid apploader: {}", msg),
            Self::NullSegment { size, source } => write!(
                f,
                "Apploader returned a null destination (size {:#x}, offset {:#x})",
                size, source
            ),
            Self::NullEntryPoint => write!(f, "Apploader returned a null entry point"),
            Self::MemoryRange { addr, len } => {
                write!(f, "Memory range {:#010x}+{:#x} is outside MEM1", addr, len)
            }

            Self::Identify(code) => write!(f, "ES identify failed: {}", code),
            Self::Credentials(code) => write!(f, "Could not read certificates: {}", code),

            Self::MemoryAllocation(msg) => write!(f, "Memory allocation failed: {}", msg),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

// ============================================================================
// ERROR TRAIT IMPLEMENTATION
// ============================================================================

impl std::error::Error for BootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BootError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub type BootResult<T> = Result<T, BootError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl BootError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) => ErrorClass::Protocol,

            Self::Drive { .. } | Self::DeviceOpen { .. } | Self::NotInitialized => {
                ErrorClass::Drive
            }

            Self::NullBuffer(_)
            | Self::Misaligned { .. }
            | Self::BufferTooSmall { .. }
            | Self::InvalidOffset { .. }
            | Self::Truncated { .. }
            | Self::DecryptedMedia(_)
            | Self::InvalidMagic(_)
            | Self::NoBootPartition
            | Self::PartitionTableTooLarge { .. }
            | Self::InvalidApploader(_)
            | Self::NullSegment { .. }
            | Self::NullEntryPoint
            | Self::MemoryRange { .. } => ErrorClass::Precondition,

            Self::Identify(_) | Self::Credentials(_) => ErrorClass::Diagnostic,

            Self::IosReload { .. }
            | Self::LockPoisoned(_)
            | Self::MemoryAllocation(_)
            | Self::Io(_)
            | Self::InvalidConfiguration(_) => ErrorClass::Host,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // Nothing can run on top of these
            Self::IosReload { .. } | Self::MemoryAllocation(_) => ErrorSeverity::Fatal,

            Self::LockPoisoned(_) => ErrorSeverity::Critical,

            Self::Identify(_) | Self::Credentials(_) => ErrorSeverity::Warning,
            Self::InvalidConfiguration(_) => ErrorSeverity::Warning,

            _ => ErrorSeverity::Error,
        }
    }

    /// Whether another disc-boot attempt can follow this failure.
    pub fn is_recoverable(&self) -> bool {
        self.severity() < ErrorSeverity::Critical
    }

    pub fn requires_shutdown(&self) -> bool {
        self.severity() >= ErrorSeverity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BootError::Drive { command: Ioctl::Read, code: -4 };
        assert_eq!(err.to_string(), "Read failed with code -4");
        assert_eq!(BootError::NoBootPartition.to_string(), "No boot partition found");
    }

    #[test]
    fn test_error_class() {
        assert_eq!(BootError::Protocol(Ioctl::Reset).class(), ErrorClass::Protocol);
        assert_eq!(BootError::DecryptedMedia(0x10000).class(), ErrorClass::Precondition);
        assert_eq!(
            BootError::NullSegment { size: 0, source: 0 }.class(),
            ErrorClass::Precondition
        );
        assert_eq!(BootError::Identify(-1017).class(), ErrorClass::Diagnostic);
    }

    #[test]
    fn test_error_recoverability() {
        assert!(BootError::Protocol(Ioctl::Read).is_recoverable());
        assert!(BootError::NoBootPartition.is_recoverable());
        assert!(!BootError::IosReload { requested: 249, code: -1 }.is_recoverable());
    }

    #[test]
    fn test_error_shutdown_requirement() {
        assert!(BootError::LockPoisoned(String::new()).requires_shutdown());
        assert!(!BootError::NotInitialized.requires_shutdown());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let boot_err: BootError = io_err.into();
        assert!(matches!(boot_err, BootError::Io(_)));
        assert_eq!(boot_err.class(), ErrorClass::Host);
    }
}
