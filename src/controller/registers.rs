//! SJA1000 PeliCAN-mode register layout and bit definitions.
//!
//! Offsets and bit patterns are the chip's, not this port's invention;
//! every constant here has a one-to-one counterpart in the Philips
//! SJA1000 datasheet (and in the header this module is ported from).

/// Mode register.
pub const MOD: u8 = 0x00;
/// Command register (write-only).
pub const CMR: u8 = 0x01;
/// Status register.
pub const SR: u8 = 0x02;
/// Interrupt register (read clears).
pub const IR: u8 = 0x03;
/// Interrupt enable register.
pub const IER: u8 = 0x04;
/// Bus timing register 0.
pub const BTR0: u8 = 0x06;
/// Bus timing register 1.
pub const BTR1: u8 = 0x07;
/// Output control register.
pub const OCR: u8 = 0x08;
/// Arbitration lost capture register.
pub const ALC: u8 = 0x0B;
/// Error code capture register.
pub const ECC: u8 = 0x0C;
/// Error warning limit register.
pub const EWL: u8 = 0x0D;
/// RX error counter.
pub const RXERR: u8 = 0x0E;
/// TX error counter.
pub const TXERR: u8 = 0x0F;
pub const ACCC0: u8 = 0x10;
pub const ACCC1: u8 = 0x11;
pub const ACCC2: u8 = 0x12;
pub const ACCC3: u8 = 0x13;
pub const ACCM0: u8 = 0x14;
pub const ACCM1: u8 = 0x15;
pub const ACCM2: u8 = 0x16;
pub const ACCM3: u8 = 0x17;
/// RX message counter.
pub const RMC: u8 = 0x1D;
/// RX buffer start address.
pub const RBSA: u8 = 0x1E;
/// Clock divider register.
pub const CDR: u8 = 0x1F;

/// Frame information byte, also the base of the SFF/EFF buffer windows.
pub const FI: u8 = 0x10;
pub const ID1: u8 = 0x11;
pub const ID2: u8 = 0x12;
pub const ID3: u8 = 0x13;
pub const ID4: u8 = 0x14;
/// Standard-frame data window start (FI, ID1, ID2, then up to 8 data bytes).
pub const SFF_BUF: u8 = 0x13;
/// Extended-frame data window start (FI, ID1..ID4, then up to 8 data bytes).
pub const EFF_BUF: u8 = 0x15;

pub const FI_FF: u8 = 0x80;
pub const FI_RTR: u8 = 0x40;

/// Mode register bits.
pub const MOD_RM: u8 = 0x01;
pub const MOD_LOM: u8 = 0x02;
pub const MOD_STM: u8 = 0x04;
pub const MOD_AFM: u8 = 0x08;
pub const MOD_SM: u8 = 0x10;

/// Command register bits.
pub const CMD_TR: u8 = 0x01;
pub const CMD_AT: u8 = 0x02;
pub const CMD_RRB: u8 = 0x04;
pub const CMD_CDO: u8 = 0x08;
pub const CMD_SRR: u8 = 0x10;

/// Interrupt register / interrupt enable register bits.
pub const IRQ_OFF: u8 = 0x00;
pub const IRQ_RI: u8 = 0x01;
pub const IRQ_TI: u8 = 0x02;
pub const IRQ_EI: u8 = 0x04;
pub const IRQ_DOI: u8 = 0x08;
pub const IRQ_WUI: u8 = 0x10;
pub const IRQ_EPI: u8 = 0x20;
pub const IRQ_ALI: u8 = 0x40;
pub const IRQ_BEI: u8 = 0x80;
pub const IRQ_ALL: u8 = 0xFF;

/// Status register bits.
pub const SR_RBS: u8 = 0x01;
pub const SR_DOS: u8 = 0x02;
pub const SR_TBS: u8 = 0x04;
pub const SR_TCS: u8 = 0x08;
pub const SR_RS: u8 = 0x10;
pub const SR_TS: u8 = 0x20;
pub const SR_ES: u8 = 0x40;
pub const SR_BS: u8 = 0x80;

/// Error code capture register.
pub const ECC_SEG: u8 = 0x1F;
pub const ECC_DIR: u8 = 0x20;
pub const ECC_ERR: u8 = 0xC0;
pub const ECC_BIT: u8 = 0x00;
pub const ECC_FORM: u8 = 0x40;
pub const ECC_STUFF: u8 = 0x80;
pub const ECC_MASK: u8 = 0xC0;

/// Clock divider register: PeliCAN-mode select bit.
pub const CDR_PELICAN: u8 = 0x80;

/// Output control register: normal output mode.
pub const OCR_MODE_NORMAL: u8 = 0x02;

/// Ceiling on messages handled per `interrupt` call before yielding,
/// so one noisy controller cannot starve the dispatch thread .
pub const MAX_IRQ: u32 = 20;

bitflags::bitflags! {
    /// Control-mode bitset (`CAN_CTRLMODE_*`), carried on the Controller
    /// and consulted by `start_xmit`/`set_normal_mode`/`interrupt`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct CtrlMode: u8 {
        const LOOPBACK        = 0x01;
        const LISTENONLY      = 0x02;
        const THREE_SAMPLES   = 0x04;
        const ONE_SHOT        = 0x08;
        const BERR_REPORTING  = 0x10;
        const PRESUME_ACK     = 0x40;
    }
}

bitflags::bitflags! {
    /// Family-level quirks, carried per board (`SJA1000_QUIRK_*`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct Quirks: u8 {
        /// The board's clock divider register does not exist / must not
        /// be touched (some bridge chips tie it off).
        const NO_CDR_REG       = 0x01;
        /// On a data-overrun interrupt the controller can wedge; the
        /// reset-ISR must run `set_mode(START)` outside the fast path.
        const RESET_ON_OVERRUN = 0x02;
    }
}
