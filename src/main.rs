use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use softchip::hle::HleApploader;
use softchip::host::{DumpBranch, FileLogger, HostCache, HostDisplay, HostStorage, StdinInput, TerminalConsole};
use softchip::image_drive::ImageDrive;
use softchip::memory::GuestMemory;
use softchip::metrics::BootMetrics;
use softchip::platform::Platform;
use softchip::{BootConfig, BootResult, DiscBoot};

fn main() {
    let config = BootConfig::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        process::exit(2);
    }

    // The cover wait has no timeout; Ctrl-C is the way out
    if let Err(e) = ctrlc::set_handler(|| {
        eprintln!("\nInterrupted.");
        process::exit(130);
    }) {
        warn!(error = %e, "could not install the Ctrl-C handler");
    }

    if let Err(e) = run(&config) {
        error!(error = %e, severity = ?e.severity(), "boot aborted");
        eprintln!("Fatal: {}", e);
        process::exit(1);
    }
}

fn run(config: &BootConfig) -> BootResult<()> {
    let transport = ImageDrive::open(&config.disc)?;
    let memory = GuestMemory::new()?;
    let metrics = Arc::new(if config.no_metrics { BootMetrics::disabled() } else { BootMetrics::new() });

    let log_path = config.log_path().unwrap_or_else(|| PathBuf::from(&config.log_file));
    let platform = Platform {
        console: Box::new(TerminalConsole::new(config.silent)),
        logger: Box::new(FileLogger::new(log_path, config.log)),
        storage: Box::new(HostStorage::new(config.sd.clone())),
        input: Box::new(StdinInput),
        display: Box::new(HostDisplay::default()),
        cache: Box::new(HostCache),
    };

    info!(disc = %config.disc.display(), ios = config.ios, "starting");
    let mut boot = DiscBoot::new(
        transport,
        HleApploader::new(),
        memory,
        platform,
        config.boot_options(),
        Arc::clone(&metrics),
    );

    match boot.run()? {
        Some(handoff) => {
            if metrics.is_enabled() {
                info!("{}", metrics);
            }
            boot.launch(handoff, &mut DumpBranch::new(config.dump.clone()))
        }
        None => {
            if metrics.is_enabled() {
                println!("{}", metrics);
            }
            Ok(())
        }
    }
}
