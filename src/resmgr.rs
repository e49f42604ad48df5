//! Component J: the resource-manager surface. Translates the external
//! `open`/`close`/`read`/`write`/`devctl` protocol () onto the
//! session fabric (component I) and the controller (component E). This
//! module owns no threads of its own — every call here runs on whatever
//! thread the host resource-manager framework dispatched the request to
//! (a thread-pool worker, or the single dispatch thread in
//! `ConcurrencyMode::SingleThread`,  "Thread-pool resource manager vs
//! single-thread").
//!
//! Standard IDs are shifted left by 18 bits at this boundary so the
//! on-wire 29-bit `mid` field matches the original QNX layout ( "MID
//! filter semantics",  "Wire format"); [`Frame::id`] itself always
//! holds the unshifted value internally.

use crate::controller::Controller;
use crate::error::{DriverError, Result};
use crate::frame::{Frame, CAN_EFF_MASK, CAN_SFF_MASK};
use crate::session::{ClientSession, DeviceSession, EndpointKind, MidFilter};
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::sync::Arc;

/// Left-shift applied to standard (11-bit) identifiers when presented at
/// the resource-manager boundary ().
const STD_MID_SHIFT: u32 = 18;
const RAW_EXT_FLAG: u32 = 1 << 30;
const RAW_RTR_FLAG: u32 = 1 << 31;

/// Packs a [`Frame`]'s identifier into the wire `mid` convention: standard
/// ids shifted into the top 11 bits of the 29-bit field, extended ids
/// using all 29 bits unshifted, with the extended/remote markers folded
/// into the two bits above the 29-bit field (unused by either id form).
fn pack_mid(frame: &Frame) -> u32 {
    let mut mid = if frame.extended {
        frame.id & CAN_EFF_MASK
    } else {
        (frame.id & CAN_SFF_MASK) << STD_MID_SHIFT
    };
    if frame.extended {
        mid |= RAW_EXT_FLAG;
    }
    if frame.remote {
        mid |= RAW_RTR_FLAG;
    }
    mid
}

fn unpack_mid(mid: u32) -> (u32, bool, bool) {
    let extended = mid & RAW_EXT_FLAG != 0;
    let remote = mid & RAW_RTR_FLAG != 0;
    let id = if extended {
        mid & CAN_EFF_MASK
    } else {
        (mid >> STD_MID_SHIFT) & CAN_SFF_MASK
    };
    (id, extended, remote)
}

/// The raw 12-byte `can_msg` representation read/written by plain
/// `read(2)`/`write(2)` calls on an endpoint ( "Wire format"): a packed
/// `mid` word followed by 8 data bytes. The raw form carries no explicit
/// length; callers needing an exact `dlc` shorter than 8 use
/// [`CanMsgExt`] through `READ_CANMSG_EXT`/`WRITE_CANMSG_EXT` instead (see
/// DESIGN.md).
pub const RAW_CAN_MSG_LEN: usize = 12;

pub fn encode_raw(frame: &Frame) -> [u8; RAW_CAN_MSG_LEN] {
    let mut out = [0u8; RAW_CAN_MSG_LEN];
    out[0..4].copy_from_slice(&pack_mid(frame).to_le_bytes());
    out[4..12].copy_from_slice(&frame.data);
    out
}

pub fn decode_raw(controller_id: u32, buf: &[u8]) -> Frame {
    let mut mid_bytes = [0u8; 4];
    let mid_len = buf.len().min(4);
    mid_bytes[..mid_len].copy_from_slice(&buf[..mid_len]);
    let mid = u32::from_le_bytes(mid_bytes);
    let (id, extended, remote) = unpack_mid(mid);
    let mut data = [0u8; 8];
    let n = buf.len().saturating_sub(4).min(8);
    data[..n].copy_from_slice(&buf[4..4 + n]);
    Frame {
        id,
        extended,
        remote,
        error: false,
        dlc: 8,
        data,
        timestamp_ms: crate::clock::now_ms(),
        echo: false,
        controller_id,
        len_data_link: 0,
    }
}

/// The richer devctl-level frame representation (`READ_CANMSG_EXT`,
/// `WRITE_CANMSG_EXT`), carrying an explicit length and timestamp
/// that the raw 12-byte form has no room for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanMsgExt {
    pub mid: u32,
    pub len: u8,
    pub data: [u8; 8],
    pub timestamp_ms: u64,
    pub is_extended_mid: bool,
    pub is_remote_frame: bool,
}

impl CanMsgExt {
    fn from_frame(frame: &Frame) -> CanMsgExt {
        CanMsgExt {
            mid: pack_mid(frame),
            len: frame.dlc,
            data: frame.data,
            timestamp_ms: frame.timestamp_ms,
            is_extended_mid: frame.extended,
            is_remote_frame: frame.remote,
        }
    }

    fn to_frame(self, controller_id: u32) -> Frame {
        let (id, extended, remote) = unpack_mid(self.mid);
        Frame {
            id,
            extended: extended || self.is_extended_mid,
            remote: remote || self.is_remote_frame,
            error: false,
            dlc: self.len.min(8),
            data: self.data,
            timestamp_ms: self.timestamp_ms,
            echo: false,
            controller_id,
            len_data_link: 0,
        }
    }
}

/// `GET_STATS` reply body (), one field per cumulative counter.
pub type DevctlStats = crate::controller::StatsSnapshot;

/// `GET_INFO` reply body (): the owning family's
/// name plus the controller's current bit-timing report. `tseg1`/`tseg2`
/// here are `BitTiming::phase_seg1`/`phase_seg2` directly, not the
/// `prop_seg`-folded `tseg1`/`tseg2` helpers — see DESIGN.md for why.
#[derive(Clone, Copy, Debug)]
pub struct DevctlInfo {
    pub driver_name: &'static str,
    pub bit_rate: u32,
    pub bit_rate_prescaler: u32,
    pub sjw: u32,
    pub tseg1: u32,
    pub tseg2: u32,
}

/// `ERROR` reply body ( "four kind-of-error counters"): the four
/// cumulative error-kind counters distinct from the full `GET_STATS`
/// snapshot (see DESIGN.md for which four).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DevctlError {
    pub bus_errors: u64,
    pub arbitration_lost: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

/// One `SET_TIMING` request body (scenario 6).
#[derive(Clone, Copy, Debug)]
pub struct DevctlTiming {
    pub bitrate: u32,
    pub sjw: u32,
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
}

/// The raw `_IOxxx`-style code a devctl request arrives tagged with,
/// before its body is decoded into a [`DevctlCmd`] ( table,  "devctl
/// codes"). The resource-manager dispatch layer hands this crate a bare
/// `u32`; [`DevctlCode::try_from`] rejects anything outside the table
/// instead of this crate guessing at an unknown command's shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum DevctlCode {
    GetMid = 1,
    SetMid = 2,
    GetMfilter = 3,
    SetMfilter = 4,
    GetPrio = 5,
    SetPrio = 6,
    GetTimestamp = 7,
    SetTimestamp = 8,
    ReadCanMsgExt = 9,
    WriteCanMsgExt = 10,
    RxFrameRawNoblock = 11,
    RxFrameRawBlock = 12,
    TxFrameRaw = 13,
    Error = 14,
    GetStats = 15,
    GetInfo = 16,
    SetTiming = 17,
    SetLatencyLimitMs = 18,
    DebugInfo = 19,
    DebugInfo2 = 20,
}

/// Decodes a raw devctl code, returning `None` for anything the table
/// doesn't list ( "unknown devctl code" -> `ENOTTY`-style rejection at
/// the caller).
pub fn decode_devctl_code(raw: u32) -> Option<DevctlCode> {
    DevctlCode::try_from(raw).ok()
}

/// The full devctl command surface ( table plus 's
/// supplemental debug codes).
#[derive(Clone, Copy, Debug)]
pub enum DevctlCmd {
    GetMid,
    SetMid(u32),
    GetMfilter,
    SetMfilter(u32),
    GetPrio,
    SetPrio(u32),
    GetTimestamp,
    SetTimestamp(u32),
    ReadCanMsgExt,
    WriteCanMsgExt(CanMsgExt),
    RxFrameRawNoblock,
    RxFrameRawBlock,
    TxFrameRaw([u8; RAW_CAN_MSG_LEN]),
    Error,
    GetStats,
    GetInfo,
    SetTiming(DevctlTiming),
    SetLatencyLimitMs(u32),
    /// `CAN_DEVCTL_DEBUG_INFO`: logs a diagnostic line, no reply payload.
    DebugInfo,
    /// `CAN_DEVCTL_DEBUG_INFO2`: returns a reserved diagnostic word.
    DebugInfo2,
}

/// A devctl reply. Exactly one variant is populated per [`DevctlCmd`];
/// `None` answers the void-reply commands (`SET_*`, `DebugInfo`).
#[derive(Clone, Copy, Debug)]
pub enum DevctlReply {
    None,
    U32(u32),
    CanMsgExt(CanMsgExt),
    Stats(DevctlStats),
    Info(DevctlInfo),
    Error(DevctlError),
}

/// One open file descriptor on `/dev/can{id}/{rx,tx}{k}` ().
/// Bundles the client session the endpoint speaks for with the device
/// session and controller it is bound to, so `read`/`write`/`devctl`
/// never need anything passed in beyond the call's own arguments.
pub struct Endpoint {
    pub device: Arc<DeviceSession>,
    pub client: Arc<ClientSession>,
}

impl Endpoint {
    /// `open`: binds a new client session of `kind` to `device` .
    pub fn open(device: Arc<DeviceSession>, kind: EndpointKind) -> Endpoint {
        let client = device.open_client(kind);
        Endpoint { device, client }
    }

    /// `close`: destroys the client session, draining its RX queue and
    /// unblocking any reader (cancellation).
    pub fn close(self) {
        self.device.close_client(&self.client);
    }

    fn controller(&self) -> &Arc<Controller> {
        &self.device.controller
    }

    /// `read(fd, buf, n)` on an rx endpoint: dequeues one frame honoring
    /// the client's latency bound and copies `min(n, 12)` bytes of the
    /// raw representation .
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let Some(frame) = self.client.read() else {
            return 0;
        };
        let encoded = encode_raw(&frame);
        let n = buf.len().min(RAW_CAN_MSG_LEN);
        buf[..n].copy_from_slice(&encoded[..n]);
        n
    }

    /// `write(fd, buf, n)` on a tx endpoint: builds one frame from `buf`
    /// and submits it, unless the controller is in listen-only mode, in
    /// which case the write is silently dropped ( "or drop if
    /// silent-mode is in force").
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        if self.controller().ctrlmode().contains(crate::controller::registers::CtrlMode::LISTENONLY) {
            return Ok(());
        }
        let frame = decode_raw(self.controller().id, buf);
        self.device.submit_tx(frame)
    }

    pub fn devctl(&self, cmd: DevctlCmd) -> Result<DevctlReply> {
        match cmd {
            DevctlCmd::GetMid => Ok(DevctlReply::U32(self.client.mid())),
            DevctlCmd::SetMid(mid) => {
                self.client.set_mid(mid);
                Ok(DevctlReply::None)
            }
            DevctlCmd::GetMfilter => Ok(DevctlReply::U32(self.client.mfilter().mask)),
            DevctlCmd::SetMfilter(value) => {
                self.client.set_mfilter(MidFilter {
                    mask: value,
                    target: value,
                })?;
                Ok(DevctlReply::None)
            }
            DevctlCmd::GetPrio => Ok(DevctlReply::U32(self.client.priority())),
            DevctlCmd::SetPrio(p) => {
                self.client.set_priority(p);
                Ok(DevctlReply::None)
            }
            DevctlCmd::GetTimestamp => Ok(DevctlReply::U32(self.client.timestamp_offset_ms() as u32)),
            DevctlCmd::SetTimestamp(offset) => {
                self.client.set_timestamp_offset_ms(i64::from(offset));
                Ok(DevctlReply::None)
            }
            DevctlCmd::ReadCanMsgExt => {
                let frame = self.client.read().ok_or(DriverError::SessionDown)?;
                Ok(DevctlReply::CanMsgExt(CanMsgExt::from_frame(&frame)))
            }
            DevctlCmd::WriteCanMsgExt(msg) => {
                if self.controller().ctrlmode().contains(crate::controller::registers::CtrlMode::LISTENONLY) {
                    return Ok(DevctlReply::None);
                }
                self.device.submit_tx(msg.to_frame(self.controller().id))?;
                Ok(DevctlReply::None)
            }
            DevctlCmd::RxFrameRawNoblock => match self.client.read_noblock() {
                Some(frame) => Ok(DevctlReply::CanMsgExt(CanMsgExt::from_frame(&frame))),
                None => Ok(DevctlReply::None),
            },
            DevctlCmd::RxFrameRawBlock => {
                let frame = self.client.read().ok_or(DriverError::SessionDown)?;
                Ok(DevctlReply::CanMsgExt(CanMsgExt::from_frame(&frame)))
            }
            DevctlCmd::TxFrameRaw(raw) => {
                if self.controller().ctrlmode().contains(crate::controller::registers::CtrlMode::LISTENONLY) {
                    return Ok(DevctlReply::None);
                }
                let frame = decode_raw(self.controller().id, &raw);
                self.device.submit_tx(frame)?;
                Ok(DevctlReply::None)
            }
            DevctlCmd::Error => {
                let s = self.controller().stats();
                Ok(DevctlReply::Error(DevctlError {
                    bus_errors: s.bus_errors,
                    arbitration_lost: s.arbitration_lost,
                    rx_errors: s.rx_errors,
                    tx_errors: s.tx_errors,
                }))
            }
            DevctlCmd::GetStats => Ok(DevctlReply::Stats(self.controller().stats())),
            DevctlCmd::GetInfo => {
                let bt = self.controller().bit_timing();
                Ok(DevctlReply::Info(DevctlInfo {
                    driver_name: self.device.family_name,
                    bit_rate: bt.bitrate,
                    bit_rate_prescaler: bt.brp,
                    sjw: bt.sjw,
                    tseg1: bt.phase_seg1,
                    tseg2: bt.phase_seg2,
                }))
            }
            DevctlCmd::SetTiming(t) => {
                self.controller()
                    .set_explicit_timing(t.bitrate, t.sjw, t.prop_seg, t.phase_seg1, t.phase_seg2)?;
                Ok(DevctlReply::None)
            }
            DevctlCmd::SetLatencyLimitMs(ms) => {
                self.client.set_latency_limit_ms(ms);
                Ok(DevctlReply::None)
            }
            DevctlCmd::DebugInfo => {
                log::error!(
                    "controller {}: debug info requested by client {}",
                    self.controller().id,
                    self.client.id
                );
                Ok(DevctlReply::None)
            }
            DevctlCmd::DebugInfo2 => Ok(DevctlReply::U32(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::registers::Quirks;
    use crate::controller::Controller;
    use crate::mmio::RamRegisters;

    fn endpoint_pair() -> (Endpoint, Endpoint, Arc<DeviceSession>) {
        let regs = Arc::new(RamRegisters::new());
        let mut controller = Controller::new(0, regs, Quirks::empty(), 8_000_000, 0, 0);
        controller.mark_virtual_loopback();
        let controller = Arc::new(controller);
        controller.register().unwrap();
        let device = DeviceSession::new(controller, "vcan", 8, 8, 0);
        let tx = Endpoint::open(Arc::clone(&device), EndpointKind::Tx);
        let rx = Endpoint::open(Arc::clone(&device), EndpointKind::Rx);
        (tx, rx, device)
    }

    #[test]
    fn raw_round_trip_preserves_standard_id_and_data() {
        let frame = Frame::data_frame(0, 0x123, false, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let encoded = encode_raw(&frame);
        assert_eq!(encoded.len(), RAW_CAN_MSG_LEN);
        let decoded = decode_raw(0, &encoded);
        assert_eq!(decoded.id, 0x123);
        assert!(!decoded.extended);
        assert_eq!(decoded.data, frame.data);
    }

    #[test]
    fn raw_round_trip_preserves_extended_id_and_rtr() {
        let frame = Frame::remote_frame(0, 0x1ABCDEF, true, 0);
        let encoded = encode_raw(&frame);
        let decoded = decode_raw(0, &encoded);
        assert_eq!(decoded.id, 0x1ABCDEF);
        assert!(decoded.extended);
        assert!(decoded.remote);
    }

    #[test]
    fn write_then_read_round_trips_over_the_endpoint_pair() {
        let (tx, rx, _device) = endpoint_pair();
        let frame = Frame::data_frame(0, 0x42, false, &[9, 9, 9]);
        let wire = encode_raw(&frame);
        tx.write(&wire).unwrap();

        let mut buf = [0u8; RAW_CAN_MSG_LEN];
        let n = rx.read(&mut buf);
        assert_eq!(n, RAW_CAN_MSG_LEN);
        let got = decode_raw(0, &buf);
        assert_eq!(got.id, 0x42);
    }

    #[test]
    fn set_and_get_mfilter_round_trips() {
        let (_tx, rx, _device) = endpoint_pair();
        rx.devctl(DevctlCmd::SetMfilter(0xABC)).unwrap();
        match rx.devctl(DevctlCmd::GetMfilter).unwrap() {
            DevctlReply::U32(v) => assert_eq!(v, 0xABC),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn set_mfilter_on_a_tx_endpoint_is_rejected() {
        let (tx, _rx, _device) = endpoint_pair();
        assert!(matches!(
            tx.devctl(DevctlCmd::SetMfilter(1)),
            Err(DriverError::NotSupported)
        ));
    }

    #[test]
    fn get_info_reports_default_bit_timing() {
        let (_tx, rx, _device) = endpoint_pair();
        match rx.devctl(DevctlCmd::GetInfo).unwrap() {
            DevctlReply::Info(info) => {
                assert_eq!(info.bit_rate, 250_000);
                assert_eq!(info.bit_rate_prescaler, 2);
                assert_eq!(info.sjw, 1);
                assert_eq!(info.tseg1, 7);
                assert_eq!(info.tseg2, 2);
                assert_eq!(info.driver_name, "vcan");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn set_timing_then_get_info_reports_the_new_values() {
        let (_tx, rx, _device) = endpoint_pair();
        rx.devctl(DevctlCmd::SetTiming(DevctlTiming {
            bitrate: 500_000,
            sjw: 1,
            prop_seg: 1,
            phase_seg1: 7,
            phase_seg2: 2,
        }))
        .unwrap();
        match rx.devctl(DevctlCmd::GetInfo).unwrap() {
            DevctlReply::Info(info) => {
                assert_eq!(info.bit_rate, 500_000);
                assert_eq!(info.sjw, 1);
                assert_eq!(info.tseg1, 7);
                assert_eq!(info.tseg2, 2);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn debug_info2_returns_a_reserved_word() {
        let (_tx, rx, _device) = endpoint_pair();
        assert!(matches!(rx.devctl(DevctlCmd::DebugInfo2).unwrap(), DevctlReply::U32(0)));
    }

    #[test]
    fn decode_devctl_code_accepts_table_entries_and_rejects_unknown_ones() {
        assert_eq!(decode_devctl_code(1), Some(DevctlCode::GetMid));
        assert_eq!(decode_devctl_code(20), Some(DevctlCode::DebugInfo2));
        assert_eq!(decode_devctl_code(0), None);
        assert_eq!(decode_devctl_code(21), None);
    }
}
