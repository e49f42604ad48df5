//! User-space driver core for the SJA1000 family of PCI CAN controllers.
//!
//! This crate implements the data plane and controller lifecycle: the
//! SJA1000 PeliCAN register protocol and ISR dispatch (component E), the
//! per-board family probes that decode PCI BARs into register windows
//! (component F), the per-device TX queue and per-client RX routing
//! fabric (components B and I), and the resource-manager-facing
//! `open`/`read`/`write`/`devctl` surface (component J). PCI bus
//! enumeration, the resource-manager IPC transport, and the accompanying
//! command-line tools are host-platform collaborators consumed through
//! the narrow traits in [`pci`] and [`irq`], not implemented here.
//!
//! [`driver::Driver`] is the owned root object a host binary constructs
//! once, probes, and tears down; everything else hangs off it.

pub mod alloc_pool;
pub mod boards;
pub mod clock;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod frame;
pub mod irq;
pub mod logging;
pub mod mmio;
pub mod pci;
pub mod queue;
pub mod resmgr;
pub mod session;
pub mod timer;

pub use config::Config;
pub use driver::Driver;
pub use error::{DriverError, Result};
pub use frame::Frame;
