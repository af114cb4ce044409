// boot.rs
//! Top-level boot flow.
//!
//! [`DiscBoot`] owns one boot context: the drive, the arena, main memory and
//! the platform collaborators. Its phase loop reloads IOS once, then keeps
//! running disc-boot attempts until one produces a [`Handoff`] or the user
//! gives up. Every failed attempt goes through the same recovery: report,
//! reset the drive, spin down, wait for a key.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::apploader::{self, ApploaderRuntime};
use crate::arena::BootArena;
use crate::channel::CommandChannel;
use crate::config::BootOptions;
use crate::credentials;
use crate::di::{DiscDrive, TICKET_SIZE};
use crate::disc::{DiscHeader, DiscIdentity};
use crate::error::{BootError, BootResult};
use crate::ios::{IosTransport, DEFAULT_IOS};
use crate::launch::{self, Handoff, Release, DISC_ID_ADDR};
use crate::memory::MainMemory;
use crate::metrics::{BootMetrics, MetricsDelta};
use crate::partition;
use crate::patches::PatchSet;
use crate::platform::{Branch, Platform};
use crate::segments::SegmentLoader;
use crate::video::select_video_mode;

pub const INSERT_DISC: &str = "Please insert a Disc.";
pub const RETRY_PROMPT: &str = "Press any button to retry.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ios,
    Play,
    Exit,
}

pub struct DiscBoot<T: IosTransport, R: ApploaderRuntime, M: MainMemory> {
    drive: DiscDrive<T>,
    runtime: R,
    memory: M,
    platform: Platform,
    arena: Box<BootArena>,
    options: BootOptions,
    metrics: Arc<BootMetrics>,
    last_attempt: Option<MetricsDelta>,
    phase: Phase,
}

impl<T, R, M> DiscBoot<T, R, M>
where
    T: IosTransport,
    R: ApploaderRuntime,
    M: MainMemory,
{
    pub fn new(
        transport: T,
        runtime: R,
        memory: M,
        platform: Platform,
        options: BootOptions,
        metrics: Arc<BootMetrics>,
    ) -> Self {
        let channel = Arc::new(CommandChannel::new(transport, Arc::clone(&metrics)));
        Self {
            drive: DiscDrive::new(channel),
            runtime,
            memory,
            platform,
            arena: BootArena::new(),
            options,
            metrics,
            last_attempt: None,
            phase: Phase::Ios,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn drive(&self) -> &DiscDrive<T> {
        &self.drive
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn metrics(&self) -> &Arc<BootMetrics> {
        &self.metrics
    }

    /// Drive traffic and outcome of the most recent attempt.
    pub fn last_attempt(&self) -> Option<&MetricsDelta> {
        self.last_attempt.as_ref()
    }

    pub fn platform_mut(&mut self) -> &mut Platform {
        &mut self.platform
    }

    // ========================================================================
    // IOS
    // ========================================================================

    fn reload(&self, version: u32) -> BootResult<()> {
        let code = self.drive.channel().lock()?.transport_mut().reload_ios(version);
        // Handles die with the old IOS whether or not the reload worked
        self.drive.invalidate();
        if code < 0 {
            return Err(BootError::IosReload { requested: version, code });
        }
        Ok(())
    }

    /// Reload the configured IOS, falling back to the default one, then
    /// bring the drive up with the motor stopped.
    pub fn load_ios(&mut self) -> BootResult<u32> {
        let requested = self.options.ios;
        if let Err(err) = self.reload(requested) {
            if requested == DEFAULT_IOS {
                return Err(err);
            }
            warn!(error = %err, fallback = DEFAULT_IOS, "falling back to the default IOS");
            self.platform
                .console
                .print(format_args!("IOS{} unavailable, using IOS{}\n", requested, DEFAULT_IOS));
            self.reload(DEFAULT_IOS)?;
        }

        let version = self.drive.channel().lock()?.transport().ios_version();
        self.drive.initialize()?;
        if let Err(err) = self.drive.stop_motor() {
            warn!(error = %err, "could not stop the motor after reload");
        }
        info!(ios = version, "IOS loaded");
        Ok(version)
    }

    // ========================================================================
    // ATTEMPT
    // ========================================================================

    /// One disc-boot attempt, from cover check to a ready handoff.
    pub fn attempt(&mut self) -> BootResult<Handoff> {
        self.metrics.record_attempt();
        self.arena.reset();

        let drive = &self.drive;
        let arena = &mut *self.arena;
        let platform = &mut self.platform;
        let memory = &mut self.memory;

        drive.initialize()?;
        if !drive.verify_cover()? {
            platform.console.print(format_args!("{}\n", INSERT_DISC));
            drive.wait_cover_close()?;
        }
        drive.reset()?;

        drive.read_disc_id(&mut arena.disc_id[..])?;
        let identity = DiscIdentity::parse(&arena.disc_id[..])?;
        identity.check_media()?;
        memory.write_slice(DISC_ID_ADDR, identity.as_bytes())?;

        drive.read_unencrypted(&mut arena.header[..], 0)?;
        let header = DiscHeader::parse(&arena.header[..])?;
        header.validate()?;
        platform.console.print(format_args!("Disc ID: {}\n", identity));
        platform.console.print(format_args!("Magic: {:#010x}\n", header.magic));
        platform.console.print(format_args!("Title: {}\n", header.title));
        platform.logger.write(format_args!("Disc ID: {}", identity));
        platform.logger.write(format_args!("Title: {}", header.title));
        info!(id = %identity, title = %header.title, "disc header");

        let boot = partition::locate(drive, arena)?;
        drive.set_offset_base(boot.byte_offset())?;

        let mut lengths = credentials::gather(drive, arena)?;
        let certificates = (lengths.certificates > 0).then(|| &arena.certificates[..lengths.certificates]);
        drive.open_partition(
            boot.offset_words,
            Some(&arena.partition_header[..TICKET_SIZE]),
            certificates,
            &mut arena.tmd[..],
        )?;
        credentials::record_tmd(&mut lengths, arena);
        if let Some(ios) = credentials::requested_ios(&arena.tmd[..lengths.tmd]) {
            platform.logger.write(format_args!("Game requests IOS{}", ios));
            debug!(ios, "requested by the game");
        }

        let region = identity.region();
        let video = select_video_mode(self.options.video_source, self.options.system_video, region);
        let mut patches = PatchSet::new(&self.options.patches, video, region);

        let (_, mut callbacks) = apploader::load(
            drive,
            arena,
            memory,
            &*platform.cache,
            &mut self.runtime,
            self.options.apploader_report,
        )?;

        SegmentLoader::new(drive, &*platform.cache, &self.metrics).run(&mut callbacks, memory, &mut patches)?;
        patches.report_missing();

        let release = Release {
            drive,
            channel: drive.channel(),
            credentials: lengths.is_complete().then(|| lengths.view(arena)),
        };
        launch::prepare(&mut callbacks, video, memory, platform, release)
    }

    /// Leave the drive in a known state after a failed attempt.
    pub fn recover(&mut self, err: &BootError) {
        self.metrics.record_failure();
        error!(error = %err, class = ?err.class(), "boot attempt failed");
        self.platform.console.print_err(format_args!("Error: {}\n", err));
        self.platform.logger.write(format_args!("Error: {}", err));

        self.drive.close();
        match self.drive.initialize() {
            Ok(()) => {
                if let Err(e) = self.drive.stop_motor() {
                    warn!(error = %e, "could not stop the motor");
                }
            }
            Err(e) => warn!(error = %e, "could not reopen the drive"),
        }
    }

    fn should_retry(&mut self) -> bool {
        if let Some(limit) = self.options.retry_limit {
            if self.metrics.failures() >= limit as u64 {
                info!(limit, "retry limit reached");
                return false;
            }
        }
        self.options.auto_retry || self.platform.input.wait_any_key(RETRY_PROMPT)
    }

    // ========================================================================
    // PHASE LOOP
    // ========================================================================

    /// Advance one phase. A handoff ends the loop.
    pub fn step(&mut self) -> BootResult<Option<Handoff>> {
        match self.phase {
            Phase::Ios => match self.load_ios() {
                Ok(_) => {
                    self.phase = Phase::Play;
                    Ok(None)
                }
                Err(err) => {
                    self.phase = Phase::Exit;
                    Err(err)
                }
            },
            Phase::Play => {
                let before = self.metrics.snapshot();
                let result = self.attempt();
                if let Err(err) = &result {
                    if !err.requires_shutdown() {
                        self.recover(err);
                    }
                }
                self.record_attempt(self.metrics.snapshot().delta(&before));

                match result {
                    Ok(handoff) => Ok(Some(handoff)),
                    Err(err) if err.requires_shutdown() => {
                        self.phase = Phase::Exit;
                        Err(err)
                    }
                    Err(_) => {
                        if !self.should_retry() {
                            self.phase = Phase::Exit;
                        }
                        Ok(None)
                    }
                }
            }
            Phase::Exit => Ok(None),
        }
    }

    fn record_attempt(&mut self, delta: MetricsDelta) {
        debug!(
            commands = delta.commands,
            bytes = delta.bytes_read,
            segments = delta.segments_loaded,
            failed = delta.failures > 0,
            elapsed = ?delta.duration,
            "attempt finished"
        );
        self.last_attempt = Some(delta);
    }

    /// Run until a handoff is ready or the loop exits. Storage and the log
    /// are brought up once, before the first phase.
    pub fn run(&mut self) -> BootResult<Option<Handoff>> {
        if self.platform.storage.initialize() {
            self.platform.logger.open();
        }
        while self.phase != Phase::Exit {
            if let Some(handoff) = self.step()? {
                return Ok(Some(handoff));
            }
        }
        info!(attempts = self.metrics.attempts(), "leaving without booting");
        Ok(None)
    }

    /// Jump to the game. The memory is handed to the branch as it is.
    pub fn launch<B: Branch + ?Sized>(self, handoff: Handoff, branch: &mut B) -> ! {
        handoff.jump(branch, &self.memory)
    }
}
