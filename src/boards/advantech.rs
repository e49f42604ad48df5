//! Advantech PCI-1680/PCM-3680/PCL-841/MIC-3680 family, ported from
//! `adv_pci.c`. Unlike the other families this one varies bar index,
//! per-chip offset, and register stride by PCI device id, so it keeps
//! its own [`BoardFamily`] impl rather than going through
//! [`super::StandardLayout`].

use std::sync::Arc;

use super::{Board, BoardFamily};
use crate::controller::registers::Quirks;
use crate::controller::Controller;
use crate::error::{AttachFailure, DriverError, Result};
use crate::mmio::{StridedRegisters, Window};
use crate::pci::{PciBus, PciHandle, PciId};

const VENDOR: u16 = 0x13fe;
const CLOCK_HZ: u32 = 16_000_000 / 2;
const OCR: u8 = 0x00; // OCR_TX0_PULLDOWN | OCR_TX0_PULLUP, board-specific bit pattern
const CDR: u8 = 0x48; // CDR_CBP | CDR_CLKOUT_MASK

fn chips_per_card(device: u16) -> u32 {
    match device {
        0x1680 | 0x2052 | 0x00c5 | 0x00d7 => 2,
        0x1681 => 1,
        _ => u32::from(device & 0x7),
    }
}

fn bar_no(device: u16) -> u8 {
    match device {
        0x1680 | 0x2052 | 0x1681 => 2,
        _ => 0,
    }
}

fn bar_offset(device: u16) -> u64 {
    match device {
        0xc201 | 0xc202 | 0xc204 | 0xc301 | 0xc302 | 0xc304 | 0x00c5 | 0x00d7 => 0x400,
        0x1680 | 0x2052 | 0x1681 => 0x0,
        _ => 0x100,
    }
}

fn bar_len(device: u16) -> usize {
    match device {
        0xc001 | 0xc002 | 0xc004 | 0xc101 | 0xc102 | 0xc104 => 0x100,
        0xc201 | 0xc202 | 0xc204 | 0xc301 | 0xc302 | 0xc304 | 0x00c5 | 0x00d7 => 0x400,
        0x1680 | 0x1681 | 0x2052 | 0x3680 => 0x80,
        _ => 0x100,
    }
}

fn is_multi_bar(device: u16) -> bool {
    matches!(device, 0x1680 | 0x2052 | 0x1681)
}

fn reg_shift(device: u16) -> u32 {
    match device {
        0xc201 | 0xc202 | 0xc204 | 0xc301 | 0xc302 | 0xc304 | 0x00c5 | 0x00d7 => 2,
        _ => 0,
    }
}

pub struct Advantech {
    ids: Vec<PciId>,
}

impl Advantech {
    pub fn new() -> Self {
        let devices: &[u16] = &[
            0x1680, 0x3680, 0x2052, 0x1681, 0xc001, 0xc002, 0xc004, 0xc101, 0xc102, 0xc104, 0xc201,
            0xc202, 0xc204, 0xc301, 0xc302, 0xc304, 0x00c5, 0x00d7,
        ];
        Advantech {
            ids: devices.iter().map(|&d| PciId::new(VENDOR, d)).collect(),
        }
    }
}

impl Default for Advantech {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardFamily for Advantech {
    fn name(&self) -> &'static str {
        "adv_pci"
    }

    fn pci_ids(&self) -> &[PciId] {
        &self.ids
    }

    fn probe(&self, bus: &dyn PciBus, handle: PciHandle, first_controller_id: u32) -> Result<Board> {
        let identity = bus.identity(handle)?;
        bus.enable_device(handle)
            .map_err(|_| DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))?;

        let device = identity.device;
        let no_channels = chips_per_card(device);
        if no_channels == 0 {
            return Err(DriverError::HardwareAbsent);
        }

        let base_bar = bar_no(device);
        let offset = bar_offset(device);
        let len = bar_len(device);
        let stride = reg_shift(device);
        let multi_bar = is_multi_bar(device);

        let mut controllers = Vec::with_capacity(no_channels as usize);
        for channel in 0..no_channels {
            let this_bar = if multi_bar { base_bar + channel as u8 } else { base_bar };
            let (bar_base, _) = bus
                .map_bar(handle, this_bar)
                .map_err(|_| DriverError::IoMapFailed(AttachFailure::NoMemory))?;
            let chip_base = if multi_bar { bar_base } else { bar_base + offset * u64::from(channel) };
            let regs = Arc::new(StridedRegisters {
                window: Window::from_bar_base(chip_base, len),
                stride,
            });
            let controller = Arc::new(Controller::new(
                first_controller_id + channel,
                regs,
                Quirks::empty(),
                CLOCK_HZ,
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
