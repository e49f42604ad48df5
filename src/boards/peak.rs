//! PEAK-System PCAN-PCI family: single-BAR, stride-0 register window,
//! one to four channels selected by the low nibble of the product id.
//! Grounded on the same vendor/device numbering the mainline Linux
//! `peak_pci.c` driver uses; no QNX port of this family was present in
//! the retrieved source, so the PCI table here follows the known vendor
//! table directly (see DESIGN.md).

use crate::controller::registers::Quirks;
use crate::pci::PciId;

use super::StandardLayout;

const VENDOR: u16 = 0x001c;
const CLOCK_HZ: u32 = 16_000_000 / 2;

fn chips_for(id: PciId) -> u32 {
    match id.device {
        0x0002 => 2,
        0x0003 => 3,
        0x0004 => 4,
        _ => 1, // 0x0001: PCAN-PCI single-channel
    }
}

pub fn family() -> StandardLayout {
    StandardLayout {
        name: "peak_pci",
        ids: vec![
            PciId::new(VENDOR, 0x0001),
            PciId::new(VENDOR, 0x0002),
            PciId::new(VENDOR, 0x0003),
            PciId::new(VENDOR, 0x0004),
        ],
        clock_hz: CLOCK_HZ,
        ocr: 0x00,
        cdr: 0x40, // CDR_CBP, no external clock divider
        quirks: Quirks::empty(),
        reg_stride: 0,
        chips: chips_for,
        base_bar: 0,
        chip_len: 0x400,
        chip_stride_bytes: 0x400,
        multi_bar: false,
    }
}
