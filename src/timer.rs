//! Component C: a one-shot delayed-callback timer, used by bus-off
//! recovery (`bus_off`) to schedule the restart after `restart_ms`.
//!
//! The QNX original binds a `timer_create`/pulse pair to a dedicated
//! receiver thread; this port keeps the same shape (a dedicated thread
//! parked on a condvar, waking to invoke the callback from normal thread
//! context) without needing a real OS timer object.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::HZ;

struct State {
    armed: bool,
    deadline: Instant,
    generation: u64,
    running: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// A single-shot expiration timer bound to a callback. There is no
/// periodic mode.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Prepares internal state and starts the pulse-receiver thread
    /// without arming it.
    pub fn setup<F>(callback: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                armed: false,
                deadline: Instant::now(),
                generation: 0,
                running: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            callback: Box::new(callback),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::spawn(move || Self::run(worker_shared));

        Timer {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let mut guard = shared.state.lock().unwrap();
            while !guard.shutdown && !guard.armed {
                guard = shared.cond.wait(guard).unwrap();
            }
            if guard.shutdown {
                return;
            }

            let my_gen = guard.generation;
            loop {
                if guard.shutdown || !guard.armed || guard.generation != my_gen {
                    break;
                }
                let now = Instant::now();
                if now >= guard.deadline {
                    guard.armed = false;
                    guard.running = true;
                    drop(guard);
                    (shared.callback)();
                    guard = shared.state.lock().unwrap();
                    guard.running = false;
                    shared.cond.notify_all();
                    break;
                }
                let wait_for = guard.deadline - now;
                let (g, _) = shared.cond.wait_timeout(guard, wait_for).unwrap();
                guard = g;
            }
        }
    }

    /// Arms a single-shot expiration `ticks * (1s / HZ)` in the future.
    /// Calling this again while already armed simply replaces the
    /// pending deadline (idempotent rearm).
    pub fn schedule(&self, ticks: u64) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.generation += 1;
        guard.armed = true;
        guard.deadline = Instant::now() + Duration::from_millis(ticks * 1000 / u64::from(HZ));
        self.shared.cond.notify_all();
    }

    /// Disarms and blocks until any in-flight callback invocation has
    /// returned. After this returns, no new callback fires unless
    /// `schedule` is called again.
    pub fn cancel_sync(&self) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.generation += 1;
        guard.armed = false;
        self.shared.cond.notify_all();
        while guard.running {
            guard = self.shared.cond.wait(guard).unwrap();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().unwrap().armed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.state.lock().unwrap();
            guard.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn schedule_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        let timer = Timer::setup(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timer.schedule(20);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_sync_prevents_pending_callback() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        let timer = Timer::setup(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timer.schedule(500);
        timer.cancel_sync();
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_sync_waits_for_in_flight_callback() {
        let running = Arc::new(AtomicBool::new(false));
        let running2 = Arc::clone(&running);
        let timer = Timer::setup(move || {
            running2.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            running2.store(false, Ordering::SeqCst);
        });
        timer.schedule(5);
        std::thread::sleep(Duration::from_millis(20));
        timer.cancel_sync();
        assert!(!running.load(Ordering::SeqCst));
    }
}
