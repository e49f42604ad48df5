//! The error-state machine reported through `can_state` .
//!
//! SJA1000 itself only exposes two status bits (`ES`, `BS`); the
//! active/warning/passive/bus-off ladder is derived from the TX/RX
//! error counters the way `can_change_state` does upstream, taking the
//! more severe of the TX-side and RX-side state.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorState {
    /// Normal operation, both counters below the warning limit.
    Active,
    /// A counter crossed the datasheet warning limit (96) but not 128.
    Warning,
    /// A counter crossed 128 but the controller has not gone bus-off.
    Passive,
    /// A counter reached 256; the controller is off the bus.
    BusOff,
    /// Held in reset (`MOD.RM` set); not participating at all.
    Stopped,
    /// Reserved for parity with the upstream `can_state` enum; this
    /// port never drives the chip into a sleep mode.
    Sleeping,
}

/// Error-warning threshold (SJA1000 default `EWL` register value).
pub const ERROR_WARNING_LIMIT: u32 = 96;
pub const ERROR_PASSIVE_LIMIT: u32 = 128;
pub const BUS_OFF_LIMIT: u32 = 256;

/// Maps a single error counter to the ladder position it implies, the
/// `state_err_to_state` threshold table from .
pub fn counter_to_state(err_count: u32) -> ErrorState {
    if err_count >= BUS_OFF_LIMIT {
        ErrorState::BusOff
    } else if err_count >= ERROR_PASSIVE_LIMIT {
        ErrorState::Passive
    } else if err_count >= ERROR_WARNING_LIMIT {
        ErrorState::Warning
    } else {
        ErrorState::Active
    }
}

fn severity(state: ErrorState) -> u8 {
    match state {
        ErrorState::Active => 0,
        ErrorState::Warning => 1,
        ErrorState::Passive => 2,
        ErrorState::BusOff => 3,
        ErrorState::Stopped | ErrorState::Sleeping => 4,
    }
}

/// The controller's reported state is the more severe of its TX-side and
/// RX-side sub-states.
pub fn combine(tx_state: ErrorState, rx_state: ErrorState) -> ErrorState {
    if severity(tx_state) >= severity(rx_state) {
        tx_state
    } else {
        rx_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_match_datasheet_limits() {
        assert_eq!(counter_to_state(0), ErrorState::Active);
        assert_eq!(counter_to_state(95), ErrorState::Active);
        assert_eq!(counter_to_state(96), ErrorState::Warning);
        assert_eq!(counter_to_state(127), ErrorState::Warning);
        assert_eq!(counter_to_state(128), ErrorState::Passive);
        assert_eq!(counter_to_state(255), ErrorState::Passive);
        assert_eq!(counter_to_state(256), ErrorState::BusOff);
    }

    #[test]
    fn combined_state_is_the_more_severe_side() {
        assert_eq!(
            combine(ErrorState::Active, ErrorState::BusOff),
            ErrorState::BusOff
        );
        assert_eq!(
            combine(ErrorState::Warning, ErrorState::Passive),
            ErrorState::Passive
        );
    }
}
