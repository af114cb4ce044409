// host.rs
//! Host implementations of the platform collaborators.
//! Console text goes to stdout, the persistent log to a file, and the final
//! branch dumps MEM1 and ends the process.

use std::fmt::{self, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::memory::{MainMemory, MEM1_BASE, MEM1_SIZE};
use crate::platform::{Branch, CacheControl, Console, Display, Input, Logger, Storage};
use crate::video::VideoMode;

// ============================================================================
// CONSOLE
// ============================================================================

/// Text console on the host terminal. Everything printed is also kept so
/// the caller can inspect it.
pub struct TerminalConsole {
    buffer: String,
    silent: bool,
}

impl TerminalConsole {
    pub fn new(silent: bool) -> Self {
        Self { buffer: String::new(), silent }
    }

    pub fn output(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn keep(&mut self, args: fmt::Arguments<'_>) {
        if let Err(e) = self.buffer.write_fmt(args) {
            trace!(error = %e, "console text dropped");
        }
    }
}

impl Console for TerminalConsole {
    fn print(&mut self, args: fmt::Arguments<'_>) {
        self.keep(args);
        if !self.silent {
            print!("{}", args);
            if let Err(e) = io::stdout().flush() {
                trace!(error = %e, "stdout flush failed");
            }
        }
    }

    fn print_err(&mut self, args: fmt::Arguments<'_>) {
        self.keep(args);
        eprint!("{}", args);
    }

    fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }
}

// ============================================================================
// LOG FILE
// ============================================================================

/// Timestamped, CRLF-terminated log lines appended to a file. A logger that
/// is disabled or failed to open drops every write.
pub struct FileLogger {
    path: PathBuf,
    enabled: bool,
    file: Option<File>,
    started: Instant,
}

impl FileLogger {
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self { path, enabled, file: None, started: Instant::now() }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Logger for FileLogger {
    fn open(&mut self) {
        if !self.enabled || self.file.is_some() {
            return;
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                debug!(path = %self.path.display(), "log file opened");
                self.file = Some(file);
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not open log file"),
        }
    }

    fn write(&mut self, args: fmt::Arguments<'_>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let elapsed = self.started.elapsed();
        let line = format!("[{:>5}.{:03}] {}\r\n", elapsed.as_secs(), elapsed.subsec_millis(), args);
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "log write failed");
        }
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                trace!(error = %e, "log flush failed");
            }
            debug!(path = %self.path.display(), "log file closed");
        }
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// A directory standing in for the SD card.
pub struct HostStorage {
    root: Option<PathBuf>,
    mounted: bool,
}

impl HostStorage {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root, mounted: false }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }
}

impl Storage for HostStorage {
    fn initialize(&mut self) -> bool {
        self.mounted = self.root.as_ref().is_some_and(|root| root.is_dir());
        debug!(mounted = self.mounted, "storage");
        self.mounted
    }

    fn release(&mut self) {
        if self.mounted {
            self.mounted = false;
            debug!("storage released");
        }
    }
}

// ============================================================================
// INPUT
// ============================================================================

/// Any line on stdin counts as a button press. End of input asks the loader
/// to quit.
#[derive(Default)]
pub struct StdinInput;

impl Input for StdinInput {
    fn wait_any_key(&mut self, prompt: &str) -> bool {
        println!("{}", prompt);
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                false
            }
        }
    }
}

// ============================================================================
// DISPLAY / CACHE
// ============================================================================

#[derive(Default)]
pub struct HostDisplay {
    mode: Option<VideoMode>,
}

impl HostDisplay {
    pub fn mode(&self) -> Option<VideoMode> {
        self.mode
    }
}

impl Display for HostDisplay {
    fn configure(&mut self, mode: VideoMode) {
        info!(mode = %mode, "video configured");
        self.mode = Some(mode);
    }
}

/// Host memory is coherent; flushing only shows up in traces.
pub struct HostCache;

impl CacheControl for HostCache {
    fn flush_range(&self, data: &[u8]) {
        trace!(addr = ?data.as_ptr(), len = data.len(), "cache flush");
    }
}

// ============================================================================
// BRANCH
// ============================================================================

/// Ends the host run where the console would jump into the game.
pub struct DumpBranch {
    dump: Option<PathBuf>,
}

impl DumpBranch {
    pub fn new(dump: Option<PathBuf>) -> Self {
        Self { dump }
    }

    pub fn write_dump(&self, memory: &dyn MainMemory) -> io::Result<()> {
        let Some(path) = &self.dump else {
            return Ok(());
        };
        let image = memory
            .region(MEM1_BASE, MEM1_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, image)?;
        info!(path = %path.display(), bytes = image.len(), "MEM1 dumped");
        Ok(())
    }
}

impl Branch for DumpBranch {
    fn branch(&mut self, entry: u32, memory: &dyn MainMemory) -> ! {
        if let Err(e) = self.write_dump(memory) {
            warn!(error = %e, "memory dump failed");
        }
        println!("Entry point {:#010x}, host run complete.", entry);
        process::exit(0)
    }
}
