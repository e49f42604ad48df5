//! Component F: board-family probes. Each family knows how to decode one
//! vendor's PCI BARs into one or more SJA1000 register windows; the
//! table in  is reproduced per-family across the submodules here.

pub mod advantech;
pub mod ems;
pub mod fintek;
pub mod kvaser;
pub mod peak;
pub mod plx;
pub mod vcan;

use std::sync::Arc;

use crate::controller::registers::Quirks;
use crate::controller::Controller;
use crate::error::{AttachFailure, DriverError, Result};
use crate::mmio::{StridedRegisters, Window};
use crate::pci::{PciBus, PciHandle, PciId};

/// One populated card: the controllers a family's probe found on it,
/// plus anything needed to tear it down.
pub struct Board {
    pub controllers: Vec<Arc<Controller>>,
    handle: PciHandle,
    /// Set for the virtual-CAN family, whose "board" is not backed by a
    /// real PCI function; the orchestrator skips PCI teardown for these.
    pub is_virtual: bool,
}

impl Board {
    pub fn handle(&self) -> PciHandle {
        self.handle
    }
}

/// A board family : a PCI id table plus a `probe`/`remove` pair.
pub trait BoardFamily: Send + Sync {
    fn name(&self) -> &'static str;
    fn pci_ids(&self) -> &[PciId];
    fn probe(&self, bus: &dyn PciBus, handle: PciHandle, next_controller_id: u32) -> Result<Board>;
}

impl BoardFamily for StandardLayout {
    fn name(&self) -> &'static str {
        self.name
    }

    fn pci_ids(&self) -> &[PciId] {
        &self.ids
    }

    fn probe(&self, bus: &dyn PciBus, handle: PciHandle, next_controller_id: u32) -> Result<Board> {
        StandardLayout::probe(self, bus, handle, next_controller_id)
    }
}

/// Parameters shared by the families whose layout is "N identical chips
/// on one or more BARs at a fixed stride" — Advantech, KVASER, PEAK,
/// the PLX-based cards, and Fintek. EMS needs its own bridge-setup
/// sequence (see [`ems`]) and vcan needs no PCI table at all (see
/// [`vcan`]), so neither uses this helper.
pub struct StandardLayout {
    pub name: &'static str,
    pub ids: Vec<PciId>,
    pub clock_hz: u32,
    pub ocr: u8,
    pub cdr: u8,
    pub quirks: Quirks,
    pub reg_stride: u32,
    /// Number of SJA1000 chips this card exposes.
    pub chips: fn(PciId) -> u32,
    /// Index of the BAR holding chip 0's registers.
    pub base_bar: u8,
    /// Per-chip byte length within the BAR.
    pub chip_len: usize,
    /// Byte offset between consecutive chips when they share one BAR
    /// (`multi_bar == false`); unused otherwise.
    pub chip_stride_bytes: u64,
    /// When true, each chip after the first lives on the next BAR index
    /// instead of at a byte offset within the same BAR (the
    /// `adv_pci_is_multi_bar` case).
    pub multi_bar: bool,
}

impl StandardLayout {
    pub fn probe(&self, bus: &dyn PciBus, handle: PciHandle, first_controller_id: u32) -> Result<Board> {
        let identity = bus.identity(handle)?;
        bus.enable_device(handle)
            .map_err(|_| DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))?;

        let id = PciId::new(identity.vendor, identity.device);
        let n = (self.chips)(id).max(1);
        let mut controllers = Vec::with_capacity(n as usize);

        for i in 0..n {
            let bar_no = if self.multi_bar { self.base_bar + i as u8 } else { self.base_bar };
            let (bar_base, _bar_len) = bus
                .map_bar(handle, bar_no)
                .map_err(|_| DriverError::IoMapFailed(AttachFailure::NoMemory))?;
            let chip_base = if self.multi_bar {
                bar_base
            } else {
                bar_base + u64::from(i) * self.chip_stride_bytes
            };
            let window = Window::from_bar_base(chip_base, self.chip_len);
            let regs = Arc::new(StridedRegisters {
                window,
                stride: self.reg_stride,
            });
            let controller = Arc::new(Controller::new(
                first_controller_id + i,
                regs,
                self.quirks,
                self.clock_hz,
                self.ocr,
                self.cdr));
            if controller.register().is_ok() {
                controller.arm_restart_timer();
                controllers.push(controller);
            }
            // A probe failure for one chip is fatal only for that chip
            // ( "Failure semantics"); siblings already pushed stay up.
        }

        if controllers.is_empty() {
            return Err(DriverError::HardwareAbsent);
        }

        Ok(Board {
            controllers,
            handle,
            is_virtual: false,
        })
    }
}
