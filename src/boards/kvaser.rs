//! Kvaser PCIcanx/PCIEcan family: single-BAR, stride-0 register window,
//! chip count derived from the product id's low nibble ( table).

use crate::controller::registers::Quirks;
use crate::pci::PciId;

use super::StandardLayout;

const VENDOR: u16 = 0x1a07;
const CLOCK_HZ: u32 = 16_000_000 / 2;

fn chips_for(id: PciId) -> u32 {
    match id.device {
        0x0008 => 4, // PCIEcan 4xHS
        0x000a => 2, // PCIEcan 2xHS
        _ => 1,      // PCIcanx I, PCIcanx II and similar single-channel products
    }
}

pub fn family() -> StandardLayout {
    StandardLayout {
        name: "kvaser_pci",
        ids: vec![
            PciId::new(VENDOR, 0x0003),
            PciId::new(VENDOR, 0x0008),
            PciId::new(VENDOR, 0x000a),
        ],
        clock_hz: CLOCK_HZ,
        ocr: 0x00,
        cdr: 0x40, // CDR_CBP, no external clock divider
        quirks: Quirks::empty(),
        reg_stride: 0,
        chips: chips_for,
        base_bar: 0,
        chip_len: 0x20,
        chip_stride_bytes: 0x20,
        multi_bar: false,
    }
}
