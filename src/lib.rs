//! SoftChip: boots a game disc by walking its partitions, running its
//! apploader and jumping into the loaded executable.
//!
//! The pipeline talks to the drive through [`ios::IosTransport`]. On the
//! console that is IOS itself (`native`); on a host it is a disc image
//! ([`image_drive::ImageDrive`]) with the apploader emulated by [`hle`].

pub mod apploader;
pub mod arena;
pub mod boot;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod di;
pub mod disc;
pub mod error;
pub mod hle;
pub mod host;
pub mod image_drive;
pub mod ios;
pub mod launch;
pub mod memory;
pub mod metrics;
#[cfg(target_arch = "powerpc")]
pub mod native;
pub mod partition;
pub mod patches;
pub mod platform;
pub mod segments;
pub mod video;

#[cfg(test)]
pub(crate) mod testutil;

pub use boot::{DiscBoot, Phase};
pub use config::{BootConfig, BootOptions};
pub use error::{BootError, BootResult};
pub use launch::Handoff;
