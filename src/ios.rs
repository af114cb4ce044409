// ios.rs
//! The seam between the boot pipeline and the privileged I/O layer.
//!
//! On the console this is the IOS IPC interface; on a host it is
//! [`crate::image_drive::ImageDrive`]. Return values follow IOS conventions:
//! non-negative on success, negative IPC error codes otherwise. Device
//! specific status words (the disc interface answers `1` for success and `2`
//! for a rejected command) are passed through untouched.

/// A handle returned by [`IosTransport::open`].
pub type Fd = i32;

pub const MODE_NONE: u32 = 0;
pub const MODE_READ: u32 = 1;

/// IOS the loader falls back to when the configured one cannot be loaded.
pub const DEFAULT_IOS: u32 = 249;

pub trait IosTransport: Send {
    fn open(&mut self, path: &str, mode: u32) -> Fd;

    fn close(&mut self, fd: Fd) -> i32;

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> i32;

    /// Single-buffer control call: `input` is the request block, `output`
    /// receives the reply.
    fn ioctl(&mut self, fd: Fd, request: u32, input: &[u8], output: &mut [u8]) -> i32;

    /// Vectored control call. Empty slices stand for null vectors and must
    /// keep their position.
    fn ioctlv(
        &mut self,
        fd: Fd,
        request: u32,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> i32;

    /// Replace the running IOS. Every handle opened before the reload is
    /// invalid afterwards.
    fn reload_ios(&mut self, version: u32) -> i32;

    fn ios_version(&self) -> u32;
}
