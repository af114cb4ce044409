// image_drive.rs
//! Disc drive emulation backed by a disc image.
//!
//! Serves `/dev/di`, `/dev/es` and `/sys/cert.sys` the way IOS would, so the
//! pipeline can run on a host. Partition data is expected unencrypted at the
//! location the partition header points to; no hashing or decryption is
//! performed.
//!

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::channel::{DriveCommand, Ioctl, DI_PROTOCOL_ERROR, DI_SUCCESS};
use crate::credentials::{CERTS_PATH, CERTS_SIZE, ES_DEVICE, ES_IDENTIFY};
use crate::di::{DI_DEVICE, TICKET_SIZE};
use crate::disc::PartitionHeader;
use crate::ios::{Fd, IosTransport, DEFAULT_IOS};

pub const DI_FD: Fd = 3;
pub const ES_FD: Fd = 4;
pub const CERT_FD: Fd = 5;

const IPC_EINVAL: i32 = -4;
const IPC_ENOENT: i32 = -6;
const ES_EINVAL: i32 = -1017;

/// IOS the emulated console boots with.
const BOOT_IOS: u32 = 36;

const COVER_POLL: Duration = Duration::from_millis(50);

/// One control call as the drive saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub request: u32,
    pub ioctl: Option<Ioctl>,
    pub words: [u32; 8],
}

impl CommandRecord {
    fn new(request: u32, cmd: &DriveCommand) -> Self {
        let mut words = [0u32; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = cmd.word(i);
        }
        Self { request, ioctl: Ioctl::from_opcode(cmd.opcode()), words }
    }
}

pub struct ImageDrive<R> {
    image: R,
    image_len: u64,
    disc_present: Arc<AtomicBool>,

    ios: u32,
    installed_ios: Vec<u32>,

    di_open: bool,
    es_open: bool,
    cert_pos: Option<usize>,

    offset_base: u64,
    /// Absolute offset of the open partition's data area.
    partition_data: Option<u64>,
    motor_running: bool,
    dvd_enabled: bool,

    certificates: Vec<u8>,
    history: Vec<CommandRecord>,
}

impl ImageDrive<File> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        info!(path = %path.display(), "disc image opened");
        Self::new(file)
    }
}

impl<R: Read + Seek + Send> ImageDrive<R> {
    pub fn new(mut image: R) -> io::Result<Self> {
        let image_len = image.seek(SeekFrom::End(0))?;
        Ok(Self {
            image,
            image_len,
            disc_present: Arc::new(AtomicBool::new(true)),
            ios: BOOT_IOS,
            installed_ios: vec![BOOT_IOS, DEFAULT_IOS],
            di_open: false,
            es_open: false,
            cert_pos: None,
            offset_base: 0,
            partition_data: None,
            motor_running: false,
            dvd_enabled: false,
            certificates: system_certificates(),
            history: Vec::new(),
        })
    }

    /// Replace the list of IOS versions a reload can pick from.
    pub fn with_installed_ios(mut self, versions: &[u32]) -> Self {
        self.installed_ios = versions.to_vec();
        self
    }

    /// Shared flag toggled to simulate opening the cover.
    pub fn disc_presence(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disc_present)
    }

    pub fn history(&self) -> &[CommandRecord] {
        &self.history
    }

    pub fn motor_running(&self) -> bool {
        self.motor_running
    }

    pub fn partition_open(&self) -> bool {
        self.partition_data.is_some()
    }

    pub fn offset_base(&self) -> u64 {
        self.offset_base
    }

    fn present(&self) -> bool {
        self.disc_present.load(Ordering::Acquire)
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> bool {
        let end = match pos.checked_add(buf.len() as u64) {
            Some(end) if end <= self.image_len => end,
            _ => {
                warn!(pos, len = buf.len(), image = self.image_len, "read past end of image");
                return false;
            }
        };
        let result = self
            .image
            .seek(SeekFrom::Start(pos))
            .and_then(|_| self.image.read_exact(buf));
        if let Err(e) = result {
            warn!(pos, end, error = %e, "image read failed");
            return false;
        }
        true
    }

    fn reply_word(output: &mut [u8], index: usize, value: u32) {
        let at = index * 4;
        if output.len() >= at + 4 {
            output[at..at + 4].copy_from_slice(&value.to_be_bytes());
        }
    }

    fn close_all(&mut self) {
        self.di_open = false;
        self.es_open = false;
        self.cert_pos = None;
        self.partition_data = None;
        self.offset_base = 0;
    }

    // ========================================================================
    // /dev/di
    // ========================================================================

    fn handle_di(&mut self, cmd: &DriveCommand, output: &mut [u8]) -> i32 {
        let Some(ioctl) = Ioctl::from_opcode(cmd.opcode()) else {
            warn!(opcode = cmd.opcode(), "unknown drive opcode");
            return DI_PROTOCOL_ERROR;
        };
        trace!(command = %ioctl, p1 = cmd.word(1), p2 = cmd.word(2), "drive command");

        match ioctl {
            Ioctl::Inquiry => {
                Self::reply_word(output, 0, 0x0002_0008);
                Self::reply_word(output, 1, 0x2008_0714);
            }
            Ioctl::ReadId => {
                if !self.present() || output.len() < 0x20 {
                    return DI_PROTOCOL_ERROR;
                }
                if !self.read_at(0, &mut output[..0x20]) {
                    return DI_PROTOCOL_ERROR;
                }
                self.motor_running = true;
            }
            Ioctl::Read | Ioctl::ReadUnencrypted => {
                let base = if ioctl == Ioctl::Read {
                    match self.partition_data {
                        Some(data) => data,
                        None => return DI_PROTOCOL_ERROR,
                    }
                } else {
                    self.offset_base
                };
                let len = cmd.word(1) as usize;
                let pos = base + ((cmd.word(2) as u64) << 2);
                if !self.present() || len > output.len() {
                    return DI_PROTOCOL_ERROR;
                }
                if !self.read_at(pos, &mut output[..len]) {
                    return DI_PROTOCOL_ERROR;
                }
            }
            Ioctl::WaitCoverClose => {
                while !self.present() {
                    thread::sleep(COVER_POLL);
                }
            }
            Ioctl::GetCover => {
                Self::reply_word(output, 0, if self.present() { 0 } else { 1 });
            }
            Ioctl::Reset => {
                self.motor_running = cmd.word(1) == 1;
                self.partition_data = None;
                self.offset_base = 0;
            }
            Ioctl::ClosePartition => self.partition_data = None,
            Ioctl::StopMotor => self.motor_running = false,
            Ioctl::EnableDvd => self.dvd_enabled = true,
            Ioctl::SetOffsetBase => self.offset_base = (cmd.word(1) as u64) << 2,
            Ioctl::GetOffsetBase => Self::reply_word(output, 0, (self.offset_base >> 2) as u32),
            // Only valid as a vectored call
            Ioctl::OpenPartition => return DI_PROTOCOL_ERROR,
        }
        DI_SUCCESS
    }

    fn open_partition(&mut self, offset_words: u32, tmd: &mut [u8]) -> i32 {
        let base = (offset_words as u64) << 2;
        let mut raw = [0u8; 0x2C0];
        if !self.present() || !self.read_at(base, &mut raw) {
            return DI_PROTOCOL_ERROR;
        }
        let header = match PartitionHeader::parse(&raw) {
            Ok(h) => h,
            Err(_) => return DI_PROTOCOL_ERROR,
        };
        let tmd_len = (header.tmd_size as usize).min(tmd.len());
        tmd.fill(0);
        if !self.read_at(base + header.tmd_offset(), &mut tmd[..tmd_len]) {
            return DI_PROTOCOL_ERROR;
        }
        self.partition_data = Some(base + header.data_offset());
        debug!(partition = base, data = base + header.data_offset(), tmd_len, "partition opened");
        DI_SUCCESS
    }

    fn identify(inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> i32 {
        if inputs.len() != 4 {
            return ES_EINVAL;
        }
        let (certs, ticket, tmd) = (inputs[0], inputs[2], inputs[3]);
        if certs.is_empty() || ticket.len() < TICKET_SIZE || tmd.is_empty() {
            return ES_EINVAL;
        }
        if let Some(key_id) = outputs.first_mut() {
            Self::reply_word(key_id, 0, 0);
        }
        0
    }
}

impl<R: Read + Seek + Send> IosTransport for ImageDrive<R> {
    fn open(&mut self, path: &str, _mode: u32) -> Fd {
        debug!(path, "open");
        match path {
            DI_DEVICE => {
                self.di_open = true;
                DI_FD
            }
            ES_DEVICE => {
                self.es_open = true;
                ES_FD
            }
            CERTS_PATH => {
                self.cert_pos = Some(0);
                CERT_FD
            }
            _ => IPC_ENOENT,
        }
    }

    fn close(&mut self, fd: Fd) -> i32 {
        match fd {
            DI_FD if self.di_open => self.di_open = false,
            ES_FD if self.es_open => self.es_open = false,
            CERT_FD if self.cert_pos.is_some() => self.cert_pos = None,
            _ => return IPC_EINVAL,
        }
        0
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> i32 {
        let pos = match (fd, self.cert_pos) {
            (CERT_FD, Some(pos)) => pos,
            _ => return IPC_EINVAL,
        };
        let n = buf.len().min(self.certificates.len() - pos);
        buf[..n].copy_from_slice(&self.certificates[pos..pos + n]);
        self.cert_pos = Some(pos + n);
        n as i32
    }

    fn ioctl(&mut self, fd: Fd, request: u32, input: &[u8], output: &mut [u8]) -> i32 {
        if fd != DI_FD || !self.di_open {
            return IPC_EINVAL;
        }
        let Some(cmd) = DriveCommand::from_bytes(input) else {
            return IPC_EINVAL;
        };
        self.history.push(CommandRecord::new(request, &cmd));
        if cmd.opcode() as u32 != request {
            return DI_PROTOCOL_ERROR;
        }
        self.handle_di(&cmd, output)
    }

    fn ioctlv(&mut self, fd: Fd, request: u32, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> i32 {
        match fd {
            ES_FD if self.es_open && request == ES_IDENTIFY => Self::identify(inputs, outputs),
            DI_FD if self.di_open => {
                let Some(cmd) = inputs.first().and_then(|b| DriveCommand::from_bytes(b)) else {
                    return IPC_EINVAL;
                };
                self.history.push(CommandRecord::new(request, &cmd));
                if cmd.opcode() as u32 != request || cmd.opcode() != Ioctl::OpenPartition.opcode() {
                    return DI_PROTOCOL_ERROR;
                }
                if inputs.len() != 3 || outputs.len() != 2 {
                    return DI_PROTOCOL_ERROR;
                }
                self.open_partition(cmd.word(1), &mut *outputs[0])
            }
            _ => IPC_EINVAL,
        }
    }

    fn reload_ios(&mut self, version: u32) -> i32 {
        if !self.installed_ios.contains(&version) {
            warn!(version, "IOS not installed");
            return -1;
        }
        self.close_all();
        self.ios = version;
        info!(version, "IOS reloaded");
        0
    }

    fn ios_version(&self) -> u32 {
        self.ios
    }
}

/// Stand-in for the console's certificate store.
fn system_certificates() -> Vec<u8> {
    let mut certs = vec![0u8; CERTS_SIZE];
    certs[..4].copy_from_slice(&0x0001_0001u32.to_be_bytes());
    let issuer = b"Root-CA00000001";
    certs[0x240..0x240 + issuer.len()].copy_from_slice(issuer);
    certs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::DiscBuilder;
    use std::io::Cursor;

    fn drive() -> ImageDrive<Cursor<Vec<u8>>> {
        ImageDrive::new(Cursor::new(DiscBuilder::bootable().build())).unwrap()
    }

    fn command(ioctl: Ioctl, params: &[u32]) -> DriveCommand {
        let mut cmd = DriveCommand::new();
        cmd.set_opcode(ioctl);
        cmd.set_params(params);
        cmd
    }

    #[test]
    fn test_handles_required() {
        let mut d = drive();
        let mut out = [0u8; 0x20];
        let cmd = command(Ioctl::Inquiry, &[]);
        assert_eq!(d.ioctl(DI_FD, 0x12, cmd.as_bytes(), &mut out), IPC_EINVAL);
        assert_eq!(d.open(DI_DEVICE, 0), DI_FD);
        assert_eq!(d.ioctl(DI_FD, 0x12, cmd.as_bytes(), &mut out), DI_SUCCESS);
        assert_eq!(d.open("/dev/nope", 0), IPC_ENOENT);
    }

    #[test]
    fn test_opcode_must_match_request() {
        let mut d = drive();
        d.open(DI_DEVICE, 0);
        let mut out = [0u8; 0x20];
        let cmd = command(Ioctl::Reset, &[1]);
        assert_eq!(d.ioctl(DI_FD, 0x71, cmd.as_bytes(), &mut out), DI_PROTOCOL_ERROR);
        assert_eq!(d.history().len(), 1);
    }

    #[test]
    fn test_reload_invalidates_handles() {
        let mut d = drive();
        d.open(DI_DEVICE, 0);
        assert_eq!(d.reload_ios(249), 0);
        assert_eq!(d.ios_version(), 249);
        let mut out = [0u8; 0x20];
        let cmd = command(Ioctl::Inquiry, &[]);
        assert_eq!(d.ioctl(DI_FD, 0x12, cmd.as_bytes(), &mut out), IPC_EINVAL);
        assert_eq!(d.reload_ios(222), -1);
        assert_eq!(d.ios_version(), 249);
    }

    #[test]
    fn test_certificate_file() {
        let mut d = drive();
        assert_eq!(d.open(CERTS_PATH, 1), CERT_FD);
        let mut buf = vec![0u8; 0x1000];
        assert_eq!(d.read(CERT_FD, &mut buf), CERTS_SIZE as i32);
        assert_eq!(&buf[..4], &[0, 1, 0, 1]);
        assert_eq!(d.read(CERT_FD, &mut buf), 0);
        assert_eq!(d.close(CERT_FD), 0);
        assert_eq!(d.close(CERT_FD), IPC_EINVAL);
    }

    #[test]
    fn test_cover_state() {
        let mut d = drive();
        d.open(DI_DEVICE, 0);
        let presence = d.disc_presence();
        let mut out = [0u8; 0x20];
        let cmd = command(Ioctl::GetCover, &[]);

        presence.store(false, Ordering::Release);
        d.ioctl(DI_FD, 0x88, cmd.as_bytes(), &mut out);
        assert_eq!(&out[..4], &[0, 0, 0, 1]);

        presence.store(true, Ordering::Release);
        d.ioctl(DI_FD, 0x88, cmd.as_bytes(), &mut out);
        assert_eq!(&out[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_read_past_end_rejected() {
        let mut d = drive();
        d.open(DI_DEVICE, 0);
        let mut out = [0u8; 0x20];
        let cmd = command(Ioctl::ReadUnencrypted, &[0x20, 0x4000_0000]);
        assert_eq!(d.ioctl(DI_FD, 0x8D, cmd.as_bytes(), &mut out), DI_PROTOCOL_ERROR);
    }
}
