//! Crate-wide error type and the subset of POSIX errno values the
//! resource-manager surface (component J) reflects back to clients.

use thiserror::Error;

/// Sub-reason for a failed PCI attach or BAR mapping attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttachFailure {
    InvalidFlags,
    AlreadyOwned,
    NoMemory,
    LockFailure,
    AttachLimit,
}

impl core::fmt::Display for AttachFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AttachFailure::InvalidFlags => "invalid flags",
            AttachFailure::AlreadyOwned => "device already owned",
            AttachFailure::NoMemory => "no memory",
            AttachFailure::LockFailure => "lock failure",
            AttachFailure::AttachLimit => "attach limit reached",
        };
        f.write_str(s)
    }
}

/// Errors produced by the driver core, from  of the design.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("contradictory configuration: {0}")]
    ConfigInvalid(&'static str),

    #[error("SJA1000 not present (MOD read back 0xFF)")]
    HardwareAbsent,

    #[error("PCI attach failed: {0}")]
    PciAttachFailed(AttachFailure),

    #[error("BAR mapping failed: {0}")]
    IoMapFailed(AttachFailure),

    #[error("bit-timing out of range for this family")]
    BitTimingOutOfRange,

    #[error("command not permitted while controller is running")]
    CommandWhileRunning,

    #[error("operation not supported by this family")]
    NotSupported,

    /// Not actually returned to a caller in the current design (queue
    /// overflow is silent, see ), kept so callers can match it when a
    /// devctl surfaces a cumulative-drop snapshot as an error record.
    #[error("queue full, oldest entries dropped")]
    QueueFull,

    #[error("session torn down")]
    SessionDown,

    #[error("controller is bus-off")]
    BusOff,

    #[error("overrun requires a mode reset")]
    OverrunRequiresReset,
}

impl DriverError {
    /// Maps to the POSIX errno the resource-manager surface replies with.
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::ConfigInvalid(_) => libc_errno::EINVAL,
            DriverError::HardwareAbsent => libc_errno::ENODEV,
            DriverError::PciAttachFailed(_) => libc_errno::ENODEV,
            DriverError::IoMapFailed(_) => libc_errno::ENOMEM,
            DriverError::BitTimingOutOfRange => libc_errno::ERANGE,
            DriverError::CommandWhileRunning => libc_errno::EBUSY,
            DriverError::NotSupported => libc_errno::EOPNOTSUPP,
            DriverError::QueueFull => libc_errno::EOK,
            DriverError::SessionDown => libc_errno::EOK,
            DriverError::BusOff => libc_errno::EOK,
            DriverError::OverrunRequiresReset => libc_errno::EOK,
        }
    }
}

/// A tiny local errno table so this crate does not need to depend on the
/// `libc` crate purely for half a dozen integer constants used only to
/// label devctl replies.
pub mod libc_errno {
    pub const EOK: i32 = 0;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
    pub const EBUSY: i32 = 16;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ENODEV: i32 = 19;
    pub const ENOMEM: i32 = 12;
}

pub type Result<T> = core::result::Result<T, DriverError>;
