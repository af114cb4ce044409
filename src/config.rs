use clap::Parser;
use std::path::PathBuf;

use crate::ios::DEFAULT_IOS;
use crate::patches::{ConsoleRegion, PatchOptions};
use crate::video::{SystemVideo, VideoSource};

#[derive(Parser, Debug, Clone)]
#[command(name = "SoftChip")]
#[command(version = "0.2.0")]
#[command(about = "Disc boot pipeline running against a disc image", long_about = None)]
pub struct BootConfig {
    /// Path to the disc image
    #[arg(short, long)]
    pub disc: PathBuf,

    /// IOS to reload before booting (falls back to 249)
    #[arg(short, long, default_value_t = DEFAULT_IOS)]
    pub ios: u32,

    /// Forced game language, -1 keeps the system setting
    #[arg(short, long, default_value_t = -1, allow_hyphen_values = true)]
    pub language: i8,

    /// Where the video mode comes from
    #[arg(long, value_enum, default_value_t = VideoSource::System)]
    pub video: VideoSource,

    /// The console's video setting
    #[arg(long, value_enum, default_value_t = SystemVideo::Ntsc)]
    pub system_video: SystemVideo,

    /// The console's region setting
    #[arg(long, value_enum, default_value_t = ConsoleRegion::Usa)]
    pub console_region: ConsoleRegion,

    /// Patch out the error 002 check
    #[arg(long)]
    pub remove_002: bool,

    /// Rewrite the console's country strings with the disc's
    #[arg(long)]
    pub country_strings: bool,

    /// Look for the chosen video mode's render table in the loaded image
    #[arg(long)]
    pub verify_video: bool,

    /// Only print errors
    #[arg(short, long)]
    pub silent: bool,

    /// Append a log to the storage directory
    #[arg(long)]
    pub log: bool,

    /// Directory standing in for the SD card
    #[arg(long)]
    pub sd: Option<PathBuf>,

    /// Log file name inside the storage directory
    #[arg(long, default_value = "Default.log")]
    pub log_file: String,

    /// Retry failed attempts without waiting for a key
    #[arg(long)]
    pub auto_retry: bool,

    /// Stop after this many failed attempts
    #[arg(long)]
    pub retries: Option<u32>,

    /// Let the apploader report its progress
    #[arg(long)]
    pub apploader_report: bool,

    /// Write MEM1 to this file instead of jumping
    #[arg(long)]
    pub dump: Option<PathBuf>,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable metrics collection
    #[arg(long)]
    pub no_metrics: bool,
}

/// What the pipeline itself needs out of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub ios: u32,
    pub video_source: VideoSource,
    pub system_video: SystemVideo,
    pub patches: PatchOptions,
    pub apploader_report: bool,
    pub auto_retry: bool,
    pub retry_limit: Option<u32>,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            ios: DEFAULT_IOS,
            video_source: VideoSource::System,
            system_video: SystemVideo::Ntsc,
            patches: PatchOptions::default(),
            apploader_report: false,
            auto_retry: false,
            retry_limit: None,
        }
    }
}

impl BootConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(-1..=9).contains(&self.language) {
            return Err(format!("Language must be -1 (system) or 0..=9. Got: {}", self.language));
        }

        if self.ios == 0 || self.ios > 255 {
            return Err(format!("IOS must be in 1..=255. Got: {}", self.ios));
        }

        if !self.disc.exists() {
            return Err(format!("Disc image not found: {}", self.disc.display()));
        }

        if self.log && self.sd.is_none() {
            return Err("Logging needs a storage directory (--sd)".to_string());
        }

        if let Some(ref sd) = self.sd {
            if !sd.is_dir() {
                return Err(format!("Storage directory not found: {}", sd.display()));
            }
        }

        if self.retries == Some(0) {
            return Err("Retry limit must be at least 1".to_string());
        }

        Ok(())
    }

    /// Get tracing log level based on verbosity
    pub fn log_level(&self) -> &str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.sd.as_ref().map(|sd| sd.join(&self.log_file))
    }

    pub fn patch_options(&self) -> PatchOptions {
        PatchOptions {
            language: u8::try_from(self.language).ok(),
            remove_002: self.remove_002,
            country_strings: self.country_strings.then_some(self.console_region),
            verify_video: self.verify_video,
        }
    }

    pub fn boot_options(&self) -> BootOptions {
        BootOptions {
            ios: self.ios,
            video_source: self.video,
            system_video: self.system_video,
            patches: self.patch_options(),
            apploader_report: self.apploader_report,
            auto_retry: self.auto_retry,
            retry_limit: self.retries,
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            disc: PathBuf::from("disc.iso"),
            ios: DEFAULT_IOS,
            language: -1,
            video: VideoSource::System,
            system_video: SystemVideo::Ntsc,
            console_region: ConsoleRegion::Usa,
            remove_002: false,
            country_strings: false,
            verify_video: false,
            silent: false,
            log: false,
            sd: None,
            log_file: String::from("Default.log"),
            auto_retry: false,
            retries: None,
            apploader_report: false,
            dump: None,
            verbose: 1,
            no_metrics: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let config = BootConfig::try_parse_from([
            "softchip",
            "--disc",
            "game.iso",
            "--language",
            "-1",
            "--video",
            "disc",
            "--remove-002",
            "--country-strings",
            "--console-region",
            "japan",
            "-vv",
        ])
        .unwrap();
        assert_eq!(config.ios, 249);
        assert_eq!(config.log_level(), "debug");

        let patches = config.patch_options();
        assert_eq!(patches.language, None);
        assert!(patches.remove_002);
        assert_eq!(patches.country_strings, Some(ConsoleRegion::Japan));
        assert_eq!(config.boot_options().video_source, VideoSource::Disc);
    }

    #[test]
    fn test_language_range() {
        let mut config = BootConfig { disc: std::env::temp_dir(), ..Default::default() };
        assert!(config.validate().is_ok());
        config.language = 10;
        assert!(config.validate().is_err());
        config.language = 9;
        assert_eq!(config.patch_options().language, Some(9));
    }

    #[test]
    fn test_missing_disc_rejected() {
        let config = BootConfig { disc: PathBuf::from("/nonexistent/disc.iso"), ..Default::default() };
        assert!(config.validate().unwrap_err().contains("Disc image not found"));
    }

    #[test]
    fn test_log_needs_storage() {
        let config = BootConfig { disc: std::env::temp_dir(), log: true, ..Default::default() };
        assert!(config.validate().is_err());
        let config = BootConfig { sd: Some(std::env::temp_dir()), ..config };
        assert!(config.validate().is_ok());
        assert!(config.log_path().unwrap().ends_with("Default.log"));
    }
}
