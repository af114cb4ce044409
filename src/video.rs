// video.rs
//! Video mode selection.

use std::fmt;

use clap::ValueEnum;

use crate::disc::DiscRegion;

/// Value written to the video mode word at 0x800000CC.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    Ntsc = 0,
    Pal = 1,
    Mpal = 4,
    Pal60 = 5,
}

impl VideoMode {
    pub fn word(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ntsc => "NTSC",
            Self::Pal => "PAL",
            Self::Mpal => "MPAL",
            Self::Pal60 => "PAL60",
        };
        f.write_str(name)
    }
}

/// Where the video mode comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoSource {
    /// The console's video setting
    System,
    /// The disc's region byte
    Disc,
}

/// The console's configured video standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SystemVideo {
    Ntsc,
    Pal,
    Mpal,
    Eurgb60,
}

impl From<SystemVideo> for VideoMode {
    fn from(system: SystemVideo) -> Self {
        match system {
            SystemVideo::Ntsc => Self::Ntsc,
            SystemVideo::Pal => Self::Pal,
            SystemVideo::Mpal => Self::Mpal,
            SystemVideo::Eurgb60 => Self::Pal60,
        }
    }
}

pub fn select_video_mode(source: VideoSource, system: SystemVideo, region: DiscRegion) -> VideoMode {
    match source {
        VideoSource::System => system.into(),
        VideoSource::Disc if region.is_pal() => VideoMode::Pal,
        VideoSource::Disc => VideoMode::Ntsc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disc_region_selects_pal() {
        for code in [b'D', b'F', b'P', b'X', b'Y'] {
            let mode = select_video_mode(VideoSource::Disc, SystemVideo::Ntsc, DiscRegion::from_code(code));
            assert_eq!(mode, VideoMode::Pal);
        }
        for code in [b'E', b'J', b'K'] {
            let mode = select_video_mode(VideoSource::Disc, SystemVideo::Pal, DiscRegion::from_code(code));
            assert_eq!(mode, VideoMode::Ntsc);
        }
    }

    #[test]
    fn test_system_setting_wins() {
        let region = DiscRegion::from_code(b'P');
        assert_eq!(select_video_mode(VideoSource::System, SystemVideo::Mpal, region), VideoMode::Mpal);
        assert_eq!(select_video_mode(VideoSource::System, SystemVideo::Eurgb60, region).word(), 5);
    }
}
