//! Thin CLI entry point. Parses the handful
//! of flags the original `main.c`'s `getopt("d:vqlwc?h")` loop recognized,
//! builds a [`Config`], and drives the [`Driver`] root object until the
//! process is asked to stop. PCI bus enumeration and the resource-manager
//! IPC transport that turns `open`/`read`/`write`/`devctl` into calls on
//! [`sja1000_can::resmgr::Endpoint`] are host-platform collaborators this
//! binary does not implement; in their absence this binary
//! probes real hardware through a null adapter that finds none and relies
//! on `Config::virtual_channels` for anything to show up.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sja1000_can::config::{Config, ConcurrencyMode};
use sja1000_can::driver::{Driver, IrqLineFactory};
use sja1000_can::error::{AttachFailure, DriverError, Result};
use sja1000_can::irq::IrqLine;
use sja1000_can::pci::{PciBus, PciHandle, PciId, PciIdentity};

const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Matches the original `getopt` option set one-for-one; nothing here
/// touches component internals directly, only [`Config`].
#[derive(Parser, Debug)]
#[command(name = "cand", version)]
struct Cli {
    /// Force selection of a specific PCI id, as `vid:did` in hex.
    #[arg(short = 'd', value_name = "vid:did")]
    device: Option<String>,

    /// List supported board families and exit.
    #[arg(short = 'l')]
    list: bool,

    /// Quiet: suppress the start-up banner.
    #[arg(short = 'q')]
    quiet: bool,

    /// Verbose; repeat for more detail, up to 6 times.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print warranty text and exit.
    #[arg(short = 'w')]
    warranty: bool,

    /// Print license text and exit.
    #[arg(short = 'c')]
    license: bool,
}

fn parse_pci_id(s: &str) -> Option<(u16, u16)> {
    let (vid, did) = s.split_once(':')?;
    let vendor = u16::from_str_radix(vid.trim(), 16).ok()?;
    let device = u16::from_str_radix(did.trim(), 16).ok()?;
    Some((vendor, device))
}

/// `-v`/`-vv`/... maps onto `log::LevelFilter` the way the source's
/// `optv` counter fed its five-level `log_err..log_trace` macros, clamped
/// at `Trace` past three repeats since there is no sixth level in the
/// `log` facade to grow into.
fn level_for_verbosity(quiet: bool, verbose: u8) -> log::LevelFilter {
    if quiet {
        return log::LevelFilter::Error;
    }
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn print_notice() {
    println!("cand {PROGRAM_VERSION} -- user-space SJA1000 PCI CAN driver");
    println!("Copyright held by the respective authors. No warranty; see -w. License: see -c.");
}

fn print_warranty() {
    println!(
        "This program is distributed in the hope that it will be useful, \
         but WITHOUT ANY WARRANTY; without even the implied warranty of \
         MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE."
    );
}

fn print_license() {
    println!(
        "This program is free software: you can redistribute it and/or modify \
         it under the terms of the MIT license or the Apache License, Version 2.0, \
         at your option."
    );
}

fn print_support(driver: &Driver) {
    println!("supported board families:");
    for name in driver.family_names() {
        println!("  {name}");
    }
}

/// No PCI bus present in this deployment shape finds nothing; a host
/// integration supplies its own [`PciBus`] backed by the platform's PCI
/// server client, which this binary assumes is provided by the host
/// platform.
struct NullPciBus;

impl PciBus for NullPciBus {
    fn find_devices(&self, _id: PciId) -> Vec<PciHandle> {
        Vec::new()
    }
    fn identity(&self, _handle: PciHandle) -> Result<PciIdentity> {
        Err(DriverError::HardwareAbsent)
    }
    fn enable_device(&self, _handle: PciHandle) -> Result<()> {
        Err(DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))
    }
    fn disable_device(&self, _handle: PciHandle) {}
    fn map_bar(&self, _handle: PciHandle, _bar_no: u8) -> Result<(u64, usize)> {
        Err(DriverError::IoMapFailed(AttachFailure::NoMemory))
    }
    fn config_read32(&self, _handle: PciHandle, _offset: u16) -> u32 {
        0
    }
    fn config_write32(&self, _handle: PciHandle, _offset: u16, _value: u32) {}
}

/// An [`IrqLine`] that never fires, for the lines [`NullPciBus`] would
/// never hand out in practice; kept so [`Driver::new`] has a concrete
/// factory to hold even when no real hardware is probed.
struct DormantIrqLine;

impl IrqLine for DormantIrqLine {
    fn wait(&self) -> bool {
        std::thread::park();
        false
    }
    fn request_stop(&self) {}
}

struct NullIrqFactory;

impl IrqLineFactory for NullIrqFactory {
    fn line_for(&self, _irq_line: u32) -> Arc<dyn IrqLine> {
        Arc::new(DormantIrqLine)
    }
}

fn run(cli: &Cli) -> std::result::Result<(), ()> {
    let log_level = level_for_verbosity(cli.quiet, cli.verbose);
    sja1000_can::logging::install(log_level);

    let forced_pci_id = match &cli.device {
        Some(s) => match parse_pci_id(s) {
            Some(id) => Some(id),
            None => {
                log::error!("invalid -d argument {s:?}, expected vid:did in hex");
                return Err(());
            }
        },
        None => None,
    };

    let mut config = Config::default();
    config.log_level = log_level;
    config.forced_pci_id = forced_pci_id;
    config.concurrency = ConcurrencyMode::ThreadPool { workers: 4 };

    if !cli.quiet {
        print_notice();
    }
    log::info!("driver start (version: {PROGRAM_VERSION})");

    let driver = match Driver::new(config, Arc::new(NullPciBus), Arc::new(NullIrqFactory)) {
        Ok(driver) => driver,
        Err(err) => {
            log::error!("configuration rejected: {err}");
            return Err(());
        }
    };

    if cli.list {
        print_support(&driver);
        return Ok(());
    }

    if let Err(err) = driver.probe_all() {
        log::error!("probe failed: {err}");
        return Err(());
    }

    let controller_ids = driver.controller_ids();
    if controller_ids.is_empty() {
        log::warn!("no controllers found (no PCI hardware, and no virtual channels configured)");
    } else {
        log::info!("driver ready: {} controller(s) online", controller_ids.len());
    }

    // The resource-manager IPC transport that would dispatch client
    // open/read/write/devctl calls onto `driver` is a host-platform
    // collaborator; absent one, this binary just keeps the
    // probed boards alive until the process is asked to exit.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.warranty {
        print_warranty();
        return ExitCode::SUCCESS;
    }
    if cli.license {
        print_license();
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}
