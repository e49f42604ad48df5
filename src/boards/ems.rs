//! EMS CPC-PCI/PCIe/104P family, ported from `ems_pci.c`. Three hardware
//! generations share one driver: v1 sits behind a PSB4610 PITA-2 bridge,
//! v2 behind a PLX 9030, v3 behind an ASIX AX99100 — each needing its own
//! bridge-register interrupt-ack sequence (`post_irq`, /) and, for
//! v1, a one-time signature check before any channel is trusted.

use std::sync::Arc;

use super::{Board, BoardFamily};
use crate::controller::registers::Quirks;
use crate::controller::Controller;
use crate::error::{AttachFailure, DriverError, Result};
use crate::mmio::{StridedRegisters, Window};
use crate::pci::{PciBus, PciHandle, PciId};

const PCI_VENDOR_ID_SIEMENS: u16 = 0x110a;
const PCI_VENDOR_ID_PLX: u16 = 0x10b5;
const PCI_DEVICE_ID_PLX_9030: u16 = 0x9030;
const PCI_VENDOR_ID_ASIX: u16 = 0x125b;
const PCI_DEVICE_ID_ASIX_AX99100_LB: u16 = 0x9100;

const EMS_PCI_CAN_CLOCK: u32 = 16_000_000 / 2;
const EMS_PCI_OCR: u8 = 0xDA; // OCR_TX0_PUSHPULL | OCR_TX1_PUSHPULL
const EMS_PCI_CDR: u8 = 0x48; // CDR_CBP | CDR_CLKOUT_MASK

const PITA2_ICR: u32 = 0x00;
const PITA2_ICR_INT0: u32 = 0x0000_0002;
const PITA2_ICR_INT0_EN: u32 = 0x0002_0000;
const PITA2_MISC: u32 = 0x1c;
const PITA2_MISC_CONFIG: u32 = 0x0400_0000;

const PLX_ICSR: u32 = 0x4c;
const PLX_ICSR_ENA_CLR: u32 = 0x0001 | 0x0040 | 0x0400;

const ASIX_LINTSR: u32 = 0x28;
const ASIX_LINTSR_INT0AC: u32 = 1;
const ASIX_LIEMR: u32 = 0x24;
const ASIX_LIEMR_L0EINTEN: u32 = 1 << 16;
const ASIX_LIEMR_LRST: u32 = 1 << 14;

#[derive(Clone, Copy)]
enum Version {
    V1,
    V2,
    V3,
}

impl Version {
    fn max_chan(self) -> u32 {
        match self {
            Version::V1 => 2,
            Version::V2 | Version::V3 => 4,
        }
    }

    fn bars(self) -> (u8, u8) {
        // (base_bar, conf_bar)
        match self {
            Version::V1 => (1, 0),
            Version::V2 => (2, 0),
            Version::V3 => (0, 5),
        }
    }

    fn conf_len(self) -> usize {
        match self {
            Version::V1 => 4096,
            Version::V2 | Version::V3 => 128,
        }
    }

    fn chan_offset_stride(self) -> (u64, usize) {
        match self {
            Version::V1 => (0x400, 0x200),
            Version::V2 => (0x400, 0x200),
            Version::V3 => (0x000, 0x100),
        }
    }
}

pub struct Ems {
    ids: Vec<PciId>,
}

impl Ems {
    pub fn new() -> Self {
        Ems {
            ids: vec![
                PciId::new(PCI_VENDOR_ID_SIEMENS, 0x2104),
                PciId::new(PCI_VENDOR_ID_PLX, PCI_DEVICE_ID_PLX_9030),
                PciId::new(PCI_VENDOR_ID_ASIX, PCI_DEVICE_ID_ASIX_AX99100_LB),
            ],
        }
    }
}

impl Default for Ems {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads an internal (non-CAN) byte register at `port`, the same
/// `ems_pci_v1_readb` 4-byte-per-register addressing the PITA-2 mux
/// exposes on the channel BAR itself, used only for the v1 signature
/// check before any channel is trusted.
fn ems_v1_readb(base: &Window, port: u32) -> u8 {
    base.read8(port * 4)
}

impl BoardFamily for Ems {
    fn name(&self) -> &'static str {
        "ems_pci"
    }

    fn pci_ids(&self) -> &[PciId] {
        &self.ids
    }

    fn probe(&self, bus: &dyn PciBus, handle: PciHandle, first_controller_id: u32) -> Result<Board> {
        let identity = bus.identity(handle)?;
        bus.enable_device(handle)
            .map_err(|_| DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))?;

        let version = if identity.vendor == PCI_VENDOR_ID_ASIX {
            Version::V3
        } else if identity.vendor == PCI_VENDOR_ID_PLX {
            Version::V2
        } else {
            Version::V1
        };

        let (base_bar, conf_bar) = version.bars();
        let (conf_base, _) = bus
            .map_bar(handle, conf_bar)
            .map_err(|_| DriverError::IoMapFailed(AttachFailure::NoMemory))?;
        let conf_window = Window::from_bar_base(conf_base, version.conf_len());

        let (chip_base_bar, _) = bus
            .map_bar(handle, base_bar)
            .map_err(|_| DriverError::IoMapFailed(AttachFailure::NoMemory))?;
        let chan_base_window = Window::from_bar_base(chip_base_bar, 4096);

        match version {
            Version::V1 => {
                conf_window.write32(PITA2_MISC, PITA2_MISC_CONFIG);
                let sig = [
                    ems_v1_readb(&chan_base_window, 0),
                    ems_v1_readb(&chan_base_window, 1),
                    ems_v1_readb(&chan_base_window, 2),
                    ems_v1_readb(&chan_base_window, 3),
                    ems_v1_readb(&chan_base_window, 4),
                ];
                if sig != [0x55, 0xAA, 0x01, 0xCB, 0x11] {
                    return Err(DriverError::HardwareAbsent);
                }
            }
            Version::V3 => {
                let liemr = conf_window.read32(ASIX_LIEMR);
                conf_window.write32(ASIX_LIEMR, liemr & !ASIX_LIEMR_LRST);
            }
            Version::V2 => {}
        }

        // `ems_pci_card_reset`: request a board reset by writing zero to
        // the base of the channel window before probing any chip.
        chan_base_window.write8(0, 0);

        let (chan_offset, chan_stride) = version.chan_offset_stride();
        let mut controllers = Vec::new();
        for i in 0..version.max_chan() {
            let chip_base = chip_base_bar + chan_offset + u64::from(i) * chan_stride as u64;
            let regs = Arc::new(StridedRegisters {
                window: Window::from_bar_base(chip_base, chan_stride),
                stride: 0,
            });
            let controller = Arc::new(Controller::new(
                first_controller_id + i,
                regs,
                Quirks::empty(),
                EMS_PCI_CAN_CLOCK,
                EMS_PCI_OCR,
                EMS_PCI_CDR));
            if controller.register().is_ok() {
                controller.arm_restart_timer();
                let ack_window = conf_window;
                let ack: Arc<dyn Fn() + Send + Sync> = match version {
                    Version::V1 => Arc::new(move || {
                        ack_window.write32(PITA2_ICR, PITA2_ICR_INT0_EN | PITA2_ICR_INT0);
                    }),
                    Version::V2 => Arc::new(move || {
                        ack_window.write32(PLX_ICSR, PLX_ICSR_ENA_CLR);
                    }),
                    Version::V3 => Arc::new(move || {
                        ack_window.write32(ASIX_LINTSR, ASIX_LINTSR_INT0AC);
                    }),
                };
                controller.set_post_irq(ack);
                controllers.push(controller);
            }
        }

        if controllers.is_empty() {
            return Err(DriverError::HardwareAbsent);
        }

        // Enable the bridge's interrupt line now that at least one
        // channel came up, mirroring the source's post-probe ack calls.
        match version {
            Version::V1 => conf_window.write32(PITA2_ICR, PITA2_ICR_INT0_EN | PITA2_ICR_INT0),
            Version::V2 => conf_window.write32(PLX_ICSR, PLX_ICSR_ENA_CLR),
            Version::V3 => {
                conf_window.write32(ASIX_LINTSR, ASIX_LINTSR_INT0AC);
                let liemr = conf_window.read32(ASIX_LIEMR);
                conf_window.write32(ASIX_LIEMR, liemr | ASIX_LIEMR_L0EINTEN);
            }
        }

        Ok(Board {
            controllers,
            handle,
            is_virtual: false,
        })
    }
}
