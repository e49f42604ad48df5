//! Fintek F81601 PCIe-to-2xCAN family, ported from `f81601.c`. The whole
//! card is one BAR holding both chips 0x80 apart; the interesting part is
//! the two byte-wide config-space straps (decode-mode/clock-source and a
//! channel-2-present strap) that must be poked before the BAR is read,
//! which this crate's [`PciBus`] only exposes at 32-bit granularity.

use std::sync::Arc;

use super::{Board, BoardFamily};
use crate::controller::registers::Quirks;
use crate::controller::Controller;
use crate::error::{AttachFailure, DriverError, Result};
use crate::mmio::{StridedRegisters, Window};
use crate::pci::{PciBus, PciHandle, PciId};

const VENDOR: u16 = 0x1c29;
const DEVICE: u16 = 0x1703;

const F81601_PCI_MAX_CHAN: u32 = 2;
const CHAN_STRIDE: u64 = 0x80;

const F81601_DECODE_REG: u16 = 0x209;
const F81601_IO_MODE: u8 = 1 << 7;
const F81601_MEM_MODE: u8 = 1 << 6;
const F81601_CFG_MODE: u8 = 1 << 5;
const F81601_CAN2_INTERNAL_CLK: u8 = 1 << 3;
const F81601_CAN1_INTERNAL_CLK: u8 = 1 << 2;
const F81601_CAN2_EN: u8 = 1 << 1;
const F81601_CAN1_EN: u8 = 1 << 0;

const F81601_TRAP_REG: u16 = 0x20a;
const F81601_CAN2_HAS_EN: u8 = 1 << 4;

const INTERNAL_CLOCK_HZ: u32 = 24_000_000 / 2;
const OCR: u8 = 0xDA; // OCR_TX0_PUSHPULL | OCR_TX1_PUSHPULL
const CDR: u8 = 0x40; // CDR_CBP

/// Reads one byte from PCI config space at `offset`, built from the
/// bus's only 32-bit accessor by shifting out the byte lane.
fn config_read_byte(bus: &dyn PciBus, handle: PciHandle, offset: u16) -> u8 {
    let aligned = offset & !0x3;
    let shift = (offset & 0x3) * 8;
    let word = bus.config_read32(handle, aligned);
    (word >> shift) as u8
}

/// Writes one byte into PCI config space at `offset` via aligned
/// read-modify-write, since `config_write32` is the bus's only mutator.
fn config_write_byte(bus: &dyn PciBus, handle: PciHandle, offset: u16, value: u8) {
    let aligned = offset & !0x3;
    let shift = (offset & 0x3) * 8;
    let word = bus.config_read32(handle, aligned);
    let mask = 0xffu32 << shift;
    let merged = (word & !mask) | (u32::from(value) << shift);
    bus.config_write32(handle, aligned, merged);
}

pub struct Fintek {
    ids: Vec<PciId>,
}

impl Fintek {
    pub fn new() -> Self {
        Fintek {
            ids: vec![PciId::new(VENDOR, DEVICE)],
        }
    }
}

impl Default for Fintek {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardFamily for Fintek {
    fn name(&self) -> &'static str {
        "f81601"
    }

    fn pci_ids(&self) -> &[PciId] {
        &self.ids
    }

    fn probe(&self, bus: &dyn PciBus, handle: PciHandle, first_controller_id: u32) -> Result<Board> {
        bus.enable_device(handle)
            .map_err(|_| DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))?;

        let decode = F81601_IO_MODE
            | F81601_MEM_MODE
            | F81601_CFG_MODE
            | F81601_CAN2_EN
            | F81601_CAN1_EN
            | F81601_CAN2_INTERNAL_CLK
            | F81601_CAN1_INTERNAL_CLK;
        config_write_byte(bus, handle, F81601_DECODE_REG, decode);

        let (bar_base, _) = bus
            .map_bar(handle, 0)
            .map_err(|_| DriverError::IoMapFailed(AttachFailure::NoMemory))?;

        // The CAN2_HW_EN strap tells us whether the second channel is
        // physically wired up on this board variant.
        let trap = config_read_byte(bus, handle, F81601_TRAP_REG);
        let count = if trap & F81601_CAN2_HAS_EN != 0 {
            F81601_PCI_MAX_CHAN
        } else {
            1
        };

        let mut controllers = Vec::with_capacity(count as usize);
        for i in 0..count {
            let chip_base = bar_base + u64::from(i) * CHAN_STRIDE;
            let regs = Arc::new(StridedRegisters {
                window: Window::from_bar_base(chip_base, CHAN_STRIDE as usize),
                stride: 0,
            });
            let controller = Arc::new(Controller::new(
                first_controller_id + i,
                regs,
                Quirks::empty(),
                INTERNAL_CLOCK_HZ,
                OCR,
                CDR,
            ));
            if controller.register().is_ok() {
                controller.arm_restart_timer();
                controllers.push(controller);
            }
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
