//! The narrow PCI surface this crate consumes. Bus enumeration, BAR
//! mapping, and capability (MSI/MSI-X) toggling are host-platform
//! primitives deliberately kept out of this crate; this trait is the
//! seam a concrete host adapter implements, modeled after the familiar
//! `PciDevice<T: ConfigRegionAccess>` split between device identity and
//! the access backend.

use crate::error::{AttachFailure, DriverError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl PciId {
    pub const fn new(vendor: u16, device: u16) -> Self {
        PciId { vendor, device }
    }
}

/// Opaque handle to one physical PCI function, as returned by `find_devices`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PciHandle(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciIdentity {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subdevice: u16,
    pub irq_line: u32,
}

/// Host-provided PCI primitives. A real deployment backs this with the
/// resource manager's PCI server client; tests back it with an in-memory
/// fake.
pub trait PciBus: Send + Sync {
    fn find_devices(&self, id: PciId) -> Vec<PciHandle>;
    fn identity(&self, handle: PciHandle) -> Result<PciIdentity>;
    fn enable_device(&self, handle: PciHandle) -> Result<()>;
    fn disable_device(&self, handle: PciHandle);
    /// Maps BAR `bar_no` and returns its base address and length. The
    /// base address encodes port-I/O vs memory per [`crate::mmio::Window`]'s
    /// threshold convention.
    fn map_bar(&self, handle: PciHandle, bar_no: u8) -> Result<(u64, usize)>;
    fn config_read32(&self, handle: PciHandle, offset: u16) -> u32;
    fn config_write32(&self, handle: PciHandle, offset: u16, value: u32);
}

pub fn attach_or_skip(bus: &dyn PciBus, handle: PciHandle) -> Result<()> {
    bus.enable_device(handle)
        .map_err(|_| DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))
}
