//! Monotonic milliseconds since process start, the timestamp base every
//! `Frame` is stamped with . Per-client epoch offsets (`GET_TIMESTAMP`/
//! `SET_TIMESTAMP`) are applied by the session fabric on top of this.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

fn start() -> Instant {
    *START.get_or_init(Instant::now)
}

pub fn now_ms() -> u64 {
    start().elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }
}
