// metrics.rs
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// BOOT METRICS
// ============================================================================

#[derive(Debug)]
pub struct BootMetrics {
    enabled: AtomicBool,

    // Drive traffic
    commands: AtomicU64,
    protocol_errors: AtomicU64,
    drive_errors: AtomicU64,
    bytes_read: AtomicU64,

    // Loading
    segments_loaded: AtomicU64,
    patches_applied: AtomicU64,

    // Attempts
    attempts: AtomicU64,
    failures: AtomicU64,

    // Timing (stored as microseconds)
    load_time_us: AtomicU64,
}

impl BootMetrics {
    /// Creates a new enabled metrics instance
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            commands: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            drive_errors: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            segments_loaded: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            load_time_us: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        let metrics = Self::new();
        metrics.enabled.store(false, Ordering::Relaxed);
        metrics
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    // ========================================================================
    // RECORDING METHODS
    // ========================================================================

    #[inline]
    pub fn record_command(&self) {
        if self.is_enabled() {
            self.commands.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_protocol_error(&self) {
        if self.is_enabled() {
            self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_drive_error(&self) {
        if self.is_enabled() {
            self.drive_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_bytes_read(&self, bytes: u64) {
        if self.is_enabled() {
            self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Records one segment copied by the apploader loop
    #[inline]
    pub fn record_segment(&self) {
        if self.is_enabled() {
            self.segments_loaded.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_patch(&self) {
        if self.is_enabled() {
            self.patches_applied.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_attempt(&self) {
        if self.is_enabled() {
            self.attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_failure(&self) {
        if self.is_enabled() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_load_time(&self, duration: Duration) {
        if self.is_enabled() {
            self.load_time_us
                .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // ACCESSOR METHODS
    // ========================================================================

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn drive_errors(&self) -> u64 {
        self.drive_errors.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn segments_loaded(&self) -> u64 {
        self.segments_loaded.load(Ordering::Relaxed)
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn load_time(&self) -> Duration {
        Duration::from_micros(self.load_time_us.load(Ordering::Relaxed))
    }

    // ========================================================================
    // COMPUTED METRICS
    // ========================================================================

    /// Percentage of attempts that ended in the recovery handler
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            0.0
        } else {
            (self.failures() as f64 / attempts as f64) * 100.0
        }
    }

    /// Read throughput over the recorded load time, in KiB/s
    pub fn read_throughput(&self) -> f64 {
        let secs = self.load_time().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_read() as f64 / 1024.0 / secs
        }
    }

    // ========================================================================
    // UTILITY METHODS
    // ========================================================================

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Instant::now(),
            commands: self.commands(),
            bytes_read: self.bytes_read(),
            segments_loaded: self.segments_loaded(),
            failures: self.failures(),
        }
    }
}

impl Default for BootMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// METRICS SNAPSHOT
// ============================================================================

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub commands: u64,
    pub bytes_read: u64,
    pub segments_loaded: u64,
    pub failures: u64,
}

impl MetricsSnapshot {
    pub fn delta(&self, other: &MetricsSnapshot) -> MetricsDelta {
        MetricsDelta {
            duration: self.timestamp.duration_since(other.timestamp),
            commands: self.commands.saturating_sub(other.commands),
            bytes_read: self.bytes_read.saturating_sub(other.bytes_read),
            segments_loaded: self.segments_loaded.saturating_sub(other.segments_loaded),
            failures: self.failures.saturating_sub(other.failures),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsDelta {
    pub duration: Duration,
    pub commands: u64,
    pub bytes_read: u64,
    pub segments_loaded: u64,
    pub failures: u64,
}

impl fmt::Display for BootMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boot Metrics:")?;
        writeln!(f, "  Enabled:           {}", self.is_enabled())?;
        writeln!(f, "  Drive Commands:    {}", self.commands())?;
        writeln!(f, "  - Protocol Errors: {}", self.protocol_errors())?;
        writeln!(f, "  - Drive Errors:    {}", self.drive_errors())?;
        writeln!(f, "  Bytes Read:        {}", self.bytes_read())?;
        writeln!(f, "  Segments Loaded:   {}", self.segments_loaded())?;
        writeln!(f, "  Patches Applied:   {}", self.patches_applied())?;
        writeln!(f, "  Attempts:          {} ({} failed)", self.attempts(), self.failures())?;
        writeln!(f, "  Load Time:         {:?}", self.load_time())?;
        writeln!(f, "  Read Throughput:   {:.1} KiB/s", self.read_throughput())?;
        writeln!(f, "  Failure Rate:      {:.2}%", self.failure_rate())
    }
}
