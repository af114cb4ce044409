// platform.rs
//! Contracts for everything around the pipeline that it only talks to:
//! the text console, the persistent log, removable storage, the controller,
//! video configuration, cache maintenance and the final branch.

use std::fmt;

use crate::memory::MainMemory;
use crate::video::VideoMode;

pub trait Console {
    fn print(&mut self, args: fmt::Arguments<'_>);

    /// Error text; shown even when silent.
    fn print_err(&mut self, args: fmt::Arguments<'_>);

    fn set_silent(&mut self, silent: bool);
}

/// Persistent log. Writes are fire-and-forget.
pub trait Logger {
    fn open(&mut self);

    fn write(&mut self, args: fmt::Arguments<'_>);

    fn close(&mut self);
}

pub trait Storage {
    /// Mount; returns whether storage is available.
    fn initialize(&mut self) -> bool;

    fn release(&mut self);
}

pub trait Input {
    /// Block until a button is pressed. `false` asks the loader to quit.
    fn wait_any_key(&mut self, prompt: &str) -> bool;
}

pub trait Display {
    fn configure(&mut self, mode: VideoMode);
}

pub trait CacheControl {
    /// Write back and invalidate the data cache lines covering `data`.
    fn flush_range(&self, data: &[u8]);
}

pub trait Branch {
    /// Transfer control to `entry`. Never returns.
    fn branch(&mut self, entry: u32, memory: &dyn MainMemory) -> !;
}

/// The collaborators one boot context works with.
pub struct Platform {
    pub console: Box<dyn Console>,
    pub logger: Box<dyn Logger>,
    pub storage: Box<dyn Storage>,
    pub input: Box<dyn Input>,
    pub display: Box<dyn Display>,
    pub cache: Box<dyn CacheControl>,
}
