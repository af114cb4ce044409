// channel.rs
//! Device command channel.
//!
//! One 32-byte command block and one 32-byte reply block are shared by every
//! disc command. They live next to the transport inside a single mutex, and
//! the only way to reach them is a [`ChannelGuard`], so populating a command,
//! issuing it and reading its reply always happen inside one critical
//! section. Other users of the transport (certificate reads, ES calls) take
//! the same lock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::arena::Aligned;
use crate::error::{BootError, BootResult};
use crate::ios::{Fd, IosTransport};
use crate::metrics::BootMetrics;

pub const COMMAND_SIZE: usize = 0x20;

/// Raw status the disc interface reports for a completed command.
pub const DI_SUCCESS: i32 = 1;
/// Raw status for a command the drive refused.
pub const DI_PROTOCOL_ERROR: i32 = 2;

// ============================================================================
// OPCODES
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    Inquiry = 0x12,
    ReadId = 0x70,
    Read = 0x71,
    WaitCoverClose = 0x79,
    GetCover = 0x88,
    Reset = 0x8A,
    OpenPartition = 0x8B,
    ClosePartition = 0x8C,
    ReadUnencrypted = 0x8D,
    StopMotor = 0xE3,
    EnableDvd = 0xF0,
    SetOffsetBase = 0xF1,
    GetOffsetBase = 0xF2,
}

impl Ioctl {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        let ioctl = match opcode {
            0x12 => Self::Inquiry,
            0x70 => Self::ReadId,
            0x71 => Self::Read,
            0x79 => Self::WaitCoverClose,
            0x88 => Self::GetCover,
            0x8A => Self::Reset,
            0x8B => Self::OpenPartition,
            0x8C => Self::ClosePartition,
            0x8D => Self::ReadUnencrypted,
            0xE3 => Self::StopMotor,
            0xF0 => Self::EnableDvd,
            0xF1 => Self::SetOffsetBase,
            0xF2 => Self::GetOffsetBase,
            _ => return None,
        };
        Some(ioctl)
    }
}

impl fmt::Display for Ioctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inquiry => "Inquiry",
            Self::ReadId => "ReadID",
            Self::Read => "Read",
            Self::WaitCoverClose => "WaitCoverClose",
            Self::GetCover => "GetCover",
            Self::Reset => "Reset",
            Self::OpenPartition => "OpenPartition",
            Self::ClosePartition => "ClosePartition",
            Self::ReadUnencrypted => "ReadUnencrypted",
            Self::StopMotor => "StopMotor",
            Self::EnableDvd => "EnableDVD",
            Self::SetOffsetBase => "SetOffsetBase",
            Self::GetOffsetBase => "GetOffsetBase",
        };
        f.write_str(name)
    }
}

// ============================================================================
// COMMAND BLOCK
// ============================================================================

/// Eight big-endian words; the opcode sits in the top byte of word 0.
#[derive(Clone)]
pub struct DriveCommand {
    block: Aligned<COMMAND_SIZE>,
}

impl DriveCommand {
    pub fn new() -> Self {
        Self { block: Aligned::zeroed() }
    }

    /// Decode a block received by a transport.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < COMMAND_SIZE {
            return None;
        }
        let mut cmd = Self::new();
        cmd.block.copy_from_slice(&bytes[..COMMAND_SIZE]);
        Some(cmd)
    }

    pub fn clear(&mut self) {
        self.block.fill(0);
    }

    pub fn set_opcode(&mut self, ioctl: Ioctl) {
        self.set_word(0, (ioctl.opcode() as u32) << 24);
    }

    pub fn opcode(&self) -> u8 {
        self.block[0]
    }

    /// Fill parameter words 1.. in order.
    pub fn set_params(&mut self, params: &[u32]) -> &mut Self {
        for (i, value) in params.iter().take(7).enumerate() {
            self.set_word(i + 1, *value);
        }
        self
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        let at = index * 4;
        self.block[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn word(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_be_bytes([
            self.block[at],
            self.block[at + 1],
            self.block[at + 2],
            self.block[at + 3],
        ])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.block[..]
    }
}

impl Default for DriveCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DriveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<u32> = (0..8).map(|i| self.word(i)).collect();
        f.debug_struct("DriveCommand").field("words", &words).finish()
    }
}

// ============================================================================
// STATUS MAPPING
// ============================================================================

/// Translate a raw status into the signed driver code reported to callers.
///
/// Positive non-success values are negated, negative IPC codes pass
/// through, and a zero status (no progress) becomes `-1`.
pub fn driver_code(raw: i32) -> i32 {
    match raw {
        // a zero code would read as success to callers
        0 => -1,
        r if r > 0 => -r,
        r => r,
    }
}

pub fn check_status(command: Ioctl, raw: i32) -> BootResult<()> {
    match raw {
        DI_SUCCESS => Ok(()),
        DI_PROTOCOL_ERROR => Err(BootError::Protocol(command)),
        other => Err(BootError::Drive { command, code: driver_code(other) }),
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

struct ChannelState<T> {
    transport: T,
    command: DriveCommand,
    output: Aligned<COMMAND_SIZE>,
}

pub struct CommandChannel<T: IosTransport> {
    state: Mutex<ChannelState<T>>,
    metrics: Arc<BootMetrics>,
}

impl<T: IosTransport> CommandChannel<T> {
    pub fn new(transport: T, metrics: Arc<BootMetrics>) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                transport,
                command: DriveCommand::new(),
                output: Aligned::zeroed(),
            }),
            metrics,
        }
    }

    /// Block until the channel is free.
    pub fn lock(&self) -> BootResult<ChannelGuard<'_, T>> {
        let state = self
            .state
            .lock()
            .map_err(|e| BootError::LockPoisoned(format!("command channel: {}", e)))?;
        Ok(ChannelGuard { state, metrics: &self.metrics })
    }

    pub fn metrics(&self) -> &Arc<BootMetrics> {
        &self.metrics
    }
}

/// Exclusive access to the command block, reply block and transport.
/// Dropping the guard unlocks the channel.
pub struct ChannelGuard<'a, T: IosTransport> {
    state: MutexGuard<'a, ChannelState<T>>,
    metrics: &'a BootMetrics,
}

impl<'a, T: IosTransport> ChannelGuard<'a, T> {
    /// Zero the command block and stamp the opcode.
    pub fn prepare(&mut self, ioctl: Ioctl) -> &mut DriveCommand {
        let command = &mut self.state.command;
        command.clear();
        command.set_opcode(ioctl);
        command
    }

    /// Issue the prepared command with the shared reply block as output.
    pub fn ioctl(&mut self, fd: Fd, ioctl: Ioctl) -> i32 {
        let state = &mut *self.state;
        self.metrics.record_command();
        trace!(command = %ioctl, "issuing drive command");
        state.output.fill(0);
        state.transport.ioctl(
            fd,
            ioctl.opcode() as u32,
            state.command.as_bytes(),
            &mut state.output[..],
        )
    }

    /// Issue the prepared command with a caller buffer as output.
    pub fn ioctl_into(&mut self, fd: Fd, ioctl: Ioctl, output: &mut [u8]) -> i32 {
        let state = &mut *self.state;
        self.metrics.record_command();
        trace!(command = %ioctl, len = output.len(), "issuing drive transfer");
        state
            .transport
            .ioctl(fd, ioctl.opcode() as u32, state.command.as_bytes(), output)
    }

    /// Vectored call. The command block is prepended to `inputs` and the
    /// reply block appended to `outputs`. At most three extra vectors each
    /// way.
    pub fn ioctlv(
        &mut self,
        fd: Fd,
        ioctl: Ioctl,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> i32 {
        let extra_in = inputs.len().min(3);
        let extra_out = outputs.len().min(3);

        let state = &mut *self.state;
        state.output.fill(0);

        let mut ins: [&[u8]; 4] = [&[]; 4];
        ins[0] = state.command.as_bytes();
        ins[1..=extra_in].copy_from_slice(&inputs[..extra_in]);

        let mut outs: [&mut [u8]; 4] = [&mut [], &mut [], &mut [], &mut []];
        for (slot, buf) in outs.iter_mut().zip(outputs.iter_mut().take(extra_out)) {
            *slot = &mut **buf;
        }
        outs[extra_out] = &mut state.output[..];

        self.metrics.record_command();
        debug!(command = %ioctl, inputs = extra_in + 1, outputs = extra_out + 1, "issuing vectored drive command");
        state.transport.ioctlv(
            fd,
            ioctl.opcode() as u32,
            &ins[..=extra_in],
            &mut outs[..=extra_out],
        )
    }

    /// Map a raw status and count failures.
    pub fn finish(&self, ioctl: Ioctl, raw: i32) -> BootResult<()> {
        let result = check_status(ioctl, raw);
        match &result {
            Err(BootError::Protocol(_)) => self.metrics.record_protocol_error(),
            Err(_) => self.metrics.record_drive_error(),
            Ok(()) => {}
        }
        result
    }

    pub fn output(&self) -> &[u8] {
        &self.state.output[..]
    }

    pub fn output_word(&self, index: usize) -> u32 {
        let out = &self.state.output;
        let at = index * 4;
        u32::from_be_bytes([out[at], out[at + 1], out[at + 2], out[at + 3]])
    }

    pub fn transport(&self) -> &T {
        &self.state.transport
    }

    /// Raw transport access for non-drive calls made under the same lock.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.state.transport
    }

    pub fn metrics(&self) -> &BootMetrics {
        self.metrics
    }
}
