// native.rs
//! Console backends.
//!
//! Thin wrappers over libogc: the IOS IPC calls, data cache maintenance,
//! MEM1 at its cached address, the disc's own apploader and the final
//! branch. Only built for the console target.

use std::ffi::CString;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;

use tracing::debug;

use crate::apploader::{ApploaderCallbacks, ApploaderRuntime, LoadStep, Segment};
use crate::disc::ApploaderHeader;
use crate::error::{BootError, BootResult};
use crate::ios::{Fd, IosTransport};
use crate::memory::{mem1_offset, MainMemory, MEM1_BASE};
use crate::platform::{Branch, CacheControl};

const IPC_EINVAL: i32 = -4;
const MAX_VECTORS: usize = 8;

#[repr(C)]
struct IoVec {
    data: *mut c_void,
    len: u32,
}

extern "C" {
    fn IOS_Open(path: *const c_char, mode: u32) -> i32;
    fn IOS_Close(fd: i32) -> i32;
    fn IOS_Read(fd: i32, buf: *mut c_void, len: i32) -> i32;
    fn IOS_Ioctl(fd: i32, ioctl: i32, buf_in: *mut c_void, len_in: i32, buf_io: *mut c_void, len_io: i32) -> i32;
    fn IOS_Ioctlv(fd: i32, ioctl: i32, cnt_in: i32, cnt_io: i32, argv: *mut IoVec) -> i32;
    fn IOS_ReloadIOS(version: i32) -> i32;
    fn IOS_GetVersion() -> i32;
    fn DCFlushRange(start: *mut c_void, len: u32);
    fn ICInvalidateRange(start: *mut c_void, len: u32);
    fn printf(format: *const c_char, ...) -> c_int;
}

// ============================================================================
// IPC
// ============================================================================

#[derive(Default)]
pub struct LibogcTransport;

fn vector(data: *const u8, len: usize) -> IoVec {
    if len == 0 {
        return IoVec { data: ptr::null_mut(), len: 0 };
    }
    IoVec { data: data as *mut c_void, len: len as u32 }
}

impl IosTransport for LibogcTransport {
    fn open(&mut self, path: &str, mode: u32) -> Fd {
        let Ok(path) = CString::new(path) else {
            return IPC_EINVAL;
        };
        unsafe { IOS_Open(path.as_ptr(), mode) }
    }

    fn close(&mut self, fd: Fd) -> i32 {
        unsafe { IOS_Close(fd) }
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> i32 {
        unsafe { IOS_Read(fd, buf.as_mut_ptr().cast(), buf.len() as i32) }
    }

    fn ioctl(&mut self, fd: Fd, request: u32, input: &[u8], output: &mut [u8]) -> i32 {
        // IOS only reads the input buffer
        unsafe {
            IOS_Ioctl(
                fd,
                request as i32,
                input.as_ptr() as *mut c_void,
                input.len() as i32,
                output.as_mut_ptr().cast(),
                output.len() as i32,
            )
        }
    }

    fn ioctlv(&mut self, fd: Fd, request: u32, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> i32 {
        if inputs.len() + outputs.len() > MAX_VECTORS {
            return IPC_EINVAL;
        }
        let mut argv: [IoVec; MAX_VECTORS] = Default::default();
        for (slot, buf) in argv.iter_mut().zip(inputs.iter()) {
            *slot = vector(buf.as_ptr(), buf.len());
        }
        for (slot, buf) in argv[inputs.len()..].iter_mut().zip(outputs.iter_mut()) {
            *slot = vector(buf.as_mut_ptr(), buf.len());
        }
        unsafe {
            IOS_Ioctlv(
                fd,
                request as i32,
                inputs.len() as i32,
                outputs.len() as i32,
                argv.as_mut_ptr(),
            )
        }
    }

    fn reload_ios(&mut self, version: u32) -> i32 {
        unsafe { IOS_ReloadIOS(version as i32) }
    }

    fn ios_version(&self) -> u32 {
        unsafe { IOS_GetVersion() as u32 }
    }
}

impl Default for IoVec {
    fn default() -> Self {
        Self { data: ptr::null_mut(), len: 0 }
    }
}

// ============================================================================
// CACHE / MEMORY
// ============================================================================

pub struct NativeCache;

impl CacheControl for NativeCache {
    fn flush_range(&self, data: &[u8]) {
        unsafe {
            DCFlushRange(data.as_ptr() as *mut c_void, data.len() as u32);
            ICInvalidateRange(data.as_ptr() as *mut c_void, data.len() as u32);
        }
    }
}

/// MEM1 at its cached address.
pub struct PhysicalMemory;

impl MainMemory for PhysicalMemory {
    fn region(&self, addr: u32, len: usize) -> BootResult<&[u8]> {
        let offset = mem1_offset(addr, len)?;
        Ok(unsafe { slice::from_raw_parts((MEM1_BASE as usize + offset) as *const u8, len) })
    }

    fn region_mut(&mut self, addr: u32, len: usize) -> BootResult<&mut [u8]> {
        let offset = mem1_offset(addr, len)?;
        Ok(unsafe { slice::from_raw_parts_mut((MEM1_BASE as usize + offset) as *mut u8, len) })
    }
}

// ============================================================================
// APPLOADER
// ============================================================================

type ReportFn = unsafe extern "C" fn(*const c_char, ...) -> c_int;
type InitFn = unsafe extern "C" fn(ReportFn);
type MainFn = unsafe extern "C" fn(*mut *mut c_void, *mut i32, *mut i32) -> i32;
type CloseFn = unsafe extern "C" fn() -> *mut c_void;
type StartFn = unsafe extern "C" fn(*mut Option<InitFn>, *mut Option<MainFn>, *mut Option<CloseFn>);

/// Runs the apploader the disc ships with.
#[derive(Default)]
pub struct NativeApploader;

pub struct NativeCallbacks {
    init: InitFn,
    main: MainFn,
    close: CloseFn,
}

impl ApploaderRuntime for NativeApploader {
    type Callbacks = NativeCallbacks;

    fn start(&mut self, header: &ApploaderHeader, _memory: &mut dyn MainMemory) -> BootResult<NativeCallbacks> {
        let mut init: Option<InitFn> = None;
        let mut main: Option<MainFn> = None;
        let mut close: Option<CloseFn> = None;
        unsafe {
            let start: StartFn = mem::transmute(header.entry_point as usize);
            start(&mut init, &mut main, &mut close);
        }
        match (init, main, close) {
            (Some(init), Some(main), Some(close)) => {
                debug!(entry = format_args!("{:#010x}", header.entry_point), "apploader entry returned");
                Ok(NativeCallbacks { init, main, close })
            }
            _ => Err(BootError::InvalidApploader("start routine left a callback unset".to_string())),
        }
    }
}

impl ApploaderCallbacks for NativeCallbacks {
    fn enable_reporting(&mut self) {
        unsafe { (self.init)(printf) }
    }

    fn load_next(&mut self, _memory: &mut dyn MainMemory) -> LoadStep {
        let mut destination: *mut c_void = ptr::null_mut();
        let mut size: i32 = 0;
        let mut offset: i32 = 0;
        let more = unsafe { (self.main)(&mut destination, &mut size, &mut offset) };
        if more == 0 {
            return LoadStep::Done;
        }
        LoadStep::More(Segment {
            destination: destination as usize as u32,
            size: size as u32,
            source_words: offset as u32,
        })
    }

    fn exit(&mut self, _memory: &mut dyn MainMemory) -> u32 {
        unsafe { (self.close)() as usize as u32 }
    }
}

// ============================================================================
// BRANCH
// ============================================================================

pub struct NativeBranch;

impl Branch for NativeBranch {
    fn branch(&mut self, entry: u32, _memory: &dyn MainMemory) -> ! {
        unsafe {
            let game: extern "C" fn() -> ! = mem::transmute(entry as usize);
            game()
        }
    }
}
