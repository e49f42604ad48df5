//! Generic PLX-bridge SJA1000 cards (Adlink, esd, IXXAT, and similar
//! vendors that resell a PLX 9050/9030 PCI-to-local-bus bridge in front
//! of one to four SJA1000 chips). Unlike [`super::ems`]'s PLX-based v2
//! variant, these cards need no bridge-register interrupt ack sequence
//! of their own — the bridge is configured in transparent-passthrough
//! mode by the card firmware — so they fit [`super::StandardLayout`]
//! directly. No QNX source for this family specifically was retrieved
//! (see DESIGN.md).

use crate::controller::registers::Quirks;
use crate::pci::PciId;

use super::StandardLayout;

const VENDOR_PLX: u16 = 0x10b5;
const CLOCK_HZ: u32 = 16_000_000 / 2;

/// Subdevice IDs distinguishing the resold cards by channel count, the
/// same "derived from product" pattern [`super::kvaser`] uses.
fn chips_for(id: PciId) -> u32 {
    match id.device {
        0x9056 => 2, // esd CAN-PCI/2
        0x3000 => 4, // IXXAT PC-I04/PCI
        _ => 1,      // Adlink PCI-7841 and similar single-channel cards
    }
}

pub fn family() -> StandardLayout {
    StandardLayout {
        name: "plx_pci",
        ids: vec![
            PciId::new(VENDOR_PLX, 0x9050),
            PciId::new(VENDOR_PLX, 0x9056),
            PciId::new(VENDOR_PLX, 0x3000),
        ],
        clock_hz: CLOCK_HZ,
        ocr: 0x00,
        cdr: 0x40,
        quirks: Quirks::empty(),
        reg_stride: 0,
        chips: chips_for,
        base_bar: 2,
        chip_len: 0x20,
        chip_stride_bytes: 0x20,
        multi_bar: false,
    }
}
