//! Virtual CAN-bus family, ported from `vcan.c`. There is no PCI function
//! behind these channels at all — no vendor/device id, no BAR, no IRQ
//! line — so this module does not implement [`BoardFamily`]; instead it
//! exposes [`spawn`], which the orchestrator (component K) calls directly
//! once per configured virtual channel count rather than through the PCI
//! enumeration loop every other family goes through.
//!
//! The original driver still pokes a RAM-backed register file through the
//! ordinary SJA1000 read/write-reg hooks and leaves looping TX back to RX
//! to a future simulator; this port takes the documented shortcut instead
//! (`controller.mark_virtual_loopback()`) and lets the session fabric
//! short-circuit TX straight into the same controller's RX queues.

use std::sync::Arc;

use super::Board;
use crate::controller::registers::Quirks;
use crate::controller::Controller;
use crate::mmio::RamRegisters;
use crate::pci::PciHandle;

const VCAN_PCI_CAN_CLOCK: u32 = 16_000_000 / 2;

/// Sentinel handle: vcan channels have no real PCI function, so
/// `Board::handle()` on a virtual board must never be passed to
/// [`crate::pci::PciBus`] — callers gate on [`Board::is_virtual`] first.
const VCAN_HANDLE: PciHandle = PciHandle(u32::MAX);

/// Builds `count` loopback-only controllers, numbered from
/// `first_controller_id`, with no backing PCI device.
pub fn spawn(count: u32, first_controller_id: u32) -> Board {
    let mut controllers = Vec::with_capacity(count as usize);
    for i in 0..count {
        let regs = Arc::new(RamRegisters::new());
        let mut controller = Controller::new(
            first_controller_id + i,
            regs,
            Quirks::empty(),
            VCAN_PCI_CAN_CLOCK,
            0,
            0,
        );
        controller.mark_virtual_loopback();
        let controller = Arc::new(controller);
        if controller.register().is_ok() {
            controllers.push(controller);
        }
    }

    Board {
        controllers,
        handle: VCAN_HANDLE,
        is_virtual: true,
    }
}
