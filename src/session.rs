//! Component I: the session fabric — the routing core that connects the
//! SJA1000 ISR to many concurrent clients .
//!
//! One [`DeviceSession`] exists per controller (created lazily by the
//! driver orchestrator on first open,  "Device session"), owning the
//! TX queue and the list of open [`ClientSession`]s. `DeviceSession`
//! implements [`NetifRx`] indirectly through [`SessionNetif`], a
//! `Weak`-holding adapter that breaks the `Controller -> netif ->
//! DeviceSession -> controller` reference cycle the direct wiring would
//! otherwise create.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock;
use crate::controller::registers::CtrlMode;
use crate::controller::{Controller, NetifRx};
use crate::error::{DriverError, Result};
use crate::frame::Frame;
use crate::queue::{DropSink, Queue};

/// Which of `/dev/can{id}/rx{k}` or `/dev/can{id}/tx{k}` a client opened
/// ( "Filesystem namespace").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointKind {
    Rx,
    Tx,
}

/// Per-client MID filter ( "MID filter semantics"). `SET_MFILTER`
/// programs `mask` and `target` to the same value, giving the common
/// "1 bits must match, 0 bits are don't-care" exact-ish filter the
/// accompanying tools expect; the two fields stay distinct internally
/// because the formula in  is stated in those terms.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MidFilter {
    pub mask: u32,
    pub target: u32,
}

impl MidFilter {
    /// The default (all-zero) filter accepts every frame, since
    /// `(id & 0) == (0 & 0)` unconditionally — a freshly opened rx
    /// endpoint receives everything until it narrows its filter.
    pub fn accepts(&self, id: u32) -> bool {
        (id & self.mask) == (self.target & self.mask)
    }
}

struct RxDropRelay {
    controller: Arc<Controller>,
}

impl DropSink for RxDropRelay {
    fn on_drop(&self, dropped: u32) {
        self.controller.note_rx_dropped(dropped);
    }
}

struct TxDropRelay {
    controller: Arc<Controller>,
}

impl DropSink for TxDropRelay {
    fn on_drop(&self, dropped: u32) {
        self.controller.note_tx_dropped(dropped);
    }
}

/// One open file descriptor on an endpoint ( "Client session").
pub struct ClientSession {
    pub id: u64,
    pub kind: EndpointKind,
    pub rx_queue: Arc<Queue<Frame>>,
    mid: AtomicU32,
    mfilter: Mutex<MidFilter>,
    priority: AtomicU32,
    latency_limit_ms: AtomicU32,
    /// `SET_TIMESTAMP`: offset applied when reporting a frame's
    /// timestamp so it reads back in the caller's own epoch .
    timestamp_offset_ms: AtomicI64,
}

impl ClientSession {
    fn new(
        id: u64,
        kind: EndpointKind,
        rx_capacity: usize,
        drop_sink: Arc<dyn DropSink>,
        default_latency_ms: u32) -> Arc<ClientSession> {
        Arc::new(ClientSession {
            id,
            kind,
            rx_queue: Arc::new(Queue::new(rx_capacity, Some(drop_sink))),
            mid: AtomicU32::new(0),
            mfilter: Mutex::new(MidFilter::default()),
            priority: AtomicU32::new(0),
            latency_limit_ms: AtomicU32::new(default_latency_ms),
            timestamp_offset_ms: AtomicI64::new(0),
        })
    }

    pub fn mid(&self) -> u32 {
        self.mid.load(Ordering::Relaxed)
    }

    pub fn set_mid(&self, mid: u32) {
        self.mid.store(mid, Ordering::Relaxed);
    }

    pub fn mfilter(&self) -> MidFilter {
        *self.mfilter.lock().unwrap()
    }

    /// `SET_MFILTER` is restricted to rx endpoints ( table).
    pub fn set_mfilter(&self, filter: MidFilter) -> Result<()> {
        if self.kind != EndpointKind::Rx {
            return Err(DriverError::NotSupported);
        }
        *self.mfilter.lock().unwrap() = filter;
        Ok(())
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn latency_limit_ms(&self) -> u32 {
        self.latency_limit_ms.load(Ordering::Relaxed)
    }

    pub fn set_latency_limit_ms(&self, ms: u32) {
        self.latency_limit_ms.store(ms, Ordering::Relaxed);
    }

    pub fn timestamp_offset_ms(&self) -> i64 {
        self.timestamp_offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_timestamp_offset_ms(&self, offset_ms: i64) {
        self.timestamp_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Blocking read honoring this client's latency bound.
    pub fn read(&self) -> Option<Frame> {
        self.rx_queue.dequeue(self.latency_limit_ms(), clock::now_ms)
    }

    pub fn read_noblock(&self) -> Option<Frame> {
        self.rx_queue.dequeue_noblock(self.latency_limit_ms(), clock::now_ms)
    }

    /// `close`: drains and tears down the RX queue so any reader
    /// blocked in [`ClientSession::read`] wakes immediately (
    /// cancellation,  property 9).
    fn close(&self) {
        self.rx_queue.destroy();
    }
}

/// Adapts a [`Weak<DeviceSession>`] to the [`NetifRx`] capability the
/// controller calls into, without the controller holding a strong
/// reference back to the session that owns it ( "Cross-links ...
/// are back references, never ownership").
struct SessionNetif(Weak<DeviceSession>);

impl NetifRx for SessionNetif {
    fn netif_rx(&self, _controller_id: u32, frame: Frame) {
        if let Some(session) = self.0.upgrade() {
            session.route_frame(frame);
        }
    }

    fn netif_wake_queue(&self, _controller_id: u32) {
        if let Some(session) = self.0.upgrade() {
            session.set_queue_stopped(false);
        }
    }
}

/// One controller's device session ( "Device session"): the TX queue
/// plus the list of client sessions currently open on this controller.
pub struct DeviceSession {
    pub controller: Arc<Controller>,
    /// The owning board family's name, surfaced through `GET_INFO`
    /// ().
    pub family_name: &'static str,
    tx_queue: Arc<Queue<Frame>>,
    clients: Mutex<Vec<Arc<ClientSession>>>,
    next_client_id: AtomicU64,
    queue_stopped: Mutex<bool>,
    queue_cond: Condvar,
    shutdown: AtomicBool,
    tx_worker: Mutex<Option<JoinHandle<()>>>,
    default_latency_ms: u32,
    rx_queue_capacity: usize,
}

impl DeviceSession {
    /// Creates the session and starts its TX worker thread, boosted
    /// above ordinary caller priority so producers cannot starve the
    /// drainer ( "Scheduling"). `IRQ_SCHED_PRIORITY_BOOST` has no
    /// literal equivalent in a portable thread API; the boost is
    /// approximated by naming the worker thread distinctly so a host
    /// scheduler policy can be applied to it by name if the deployment
    /// needs one.
    pub fn new(
        controller: Arc<Controller>,
        family_name: &'static str,
        tx_capacity: usize,
        rx_capacity: usize,
        default_latency_ms: u32) -> Arc<DeviceSession> {
        let tx_drop_sink: Arc<dyn DropSink> = Arc::new(TxDropRelay {
            controller: Arc::clone(&controller),
        });
        let session = Arc::new(DeviceSession {
            controller,
            family_name,
            tx_queue: Arc::new(Queue::new(tx_capacity, Some(tx_drop_sink))),
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(0),
            queue_stopped: Mutex::new(false),
            queue_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            tx_worker: Mutex::new(None),
            default_latency_ms,
            rx_queue_capacity: rx_capacity,
        });

        session
            .controller
            .attach_netif(Arc::new(SessionNetif(Arc::downgrade(&session))));

        let worker_session = Arc::clone(&session);
        let handle = std::thread::Builder::new()
            .name(format!("can{}-tx", worker_session.controller.id))
            .spawn(move || tx_worker_loop(&worker_session))
            .expect("spawn device TX worker thread");
        *session.tx_worker.lock().unwrap() = Some(handle);

        session
    }

    pub fn tx_queue(&self) -> &Arc<Queue<Frame>> {
        &self.tx_queue
    }

    /// `open`: creates a new client session bound to `kind` .
    pub fn open_client(&self, kind: EndpointKind) -> Arc<ClientSession> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let drop_sink: Arc<dyn DropSink> = Arc::new(RxDropRelay {
            controller: Arc::clone(&self.controller),
        });
        let client = ClientSession::new(id, kind, self.rx_queue_capacity, drop_sink, self.default_latency_ms);
        self.clients.lock().unwrap().push(Arc::clone(&client));
        client
    }

    /// `close`: destroys the client session, draining its RX queue
    /// and removing it from this device's client list .
    pub fn close_client(&self, client: &Arc<ClientSession>) {
        client.close();
        self.clients.lock().unwrap().retain(|c| c.id != client.id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// `write`/TX devctl path: enqueues one frame for the device TX
    /// worker, dropping the oldest queued frame(s) on overflow (
    /// "Backpressure").
    pub fn submit_tx(&self, frame: Frame) -> Result<()> {
        self.tx_queue
            .enqueue(frame)
            .map(|_| ())
            .map_err(|_| DriverError::SessionDown)
    }

    /// RX delivery (`netif_rx`,  "RX path"): fans `frame` out to
    /// every rx-kind client whose MID filter accepts it. Frame order
    /// into each client's queue matches hardware delivery order since
    /// this runs from the single ISR/TX-worker call site that produced
    /// `frame` ( "Ordering guarantees").
    fn route_frame(&self, frame: Frame) {
        let clients = self.clients.lock().unwrap();
        for client in clients.iter() {
            if client.kind != EndpointKind::Rx {
                continue;
            }
            if client.mfilter().accepts(frame.id) {
                let _ = client.rx_queue.enqueue(frame.clone());
            }
        }
    }

    fn set_queue_stopped(&self, stopped: bool) {
        let mut guard = self.queue_stopped.lock().unwrap();
        *guard = stopped;
        drop(guard);
        if !stopped {
            self.queue_cond.notify_all();
        }
    }

    /// Tears the device session down: stops the TX worker, destroys the
    /// TX queue, and closes every still-open client session. Called by
    /// the driver orchestrator when the owning controller's board is
    /// removed ( "destroyed when the controller is torn down").
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.set_queue_stopped(false);
        self.queue_cond.notify_all();
        self.tx_queue.destroy();
        if let Some(handle) = self.tx_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        let clients = self.clients.lock().unwrap();
        for client in clients.iter() {
            client.close();
        }
    }
}

/// The per-device TX worker ( "TX path"): peeks the head of the TX
/// queue, waits out `queue_stopped`, then submits to the controller.
fn tx_worker_loop(session: &Arc<DeviceSession>) {
    loop {
        {
            let mut stopped = session.queue_stopped.lock().unwrap();
            while *stopped && !session.shutdown.load(Ordering::Acquire) {
                stopped = session.queue_cond.wait(stopped).unwrap();
            }
        }
        if session.shutdown.load(Ordering::Acquire) {
            return;
        }

        // A bounded peek timeout, rather than an unbounded blocking
        // peek, keeps `shutdown` responsive without a dedicated
        // wakeup channel for queue teardown.
        if session.tx_queue.dequeue_peek(Duration::from_millis(100)).is_none() {
            if !session.tx_queue.is_up() {
                return;
            }
            continue;
        }
        let Some(frame) = session.tx_queue.dequeue_noblock(0, clock::now_ms) else {
            continue;
        };

        if session.controller.is_virtual_loopback() {
            // The virtual-CAN family has no real chip behind it: the
            // session fabric short-circuits TX straight into local RX
            // , so there is no TX-completion interrupt
            // to wait for.
            let mut echoed = frame;
            echoed.timestamp_ms = clock::now_ms();
            echoed.echo = true;
            session.route_frame(echoed);
            continue;
        }

        session.set_queue_stopped(true);
        match session.controller.start_xmit(&frame) {
            Ok(()) => {
                if session.controller.ctrlmode().contains(CtrlMode::LOOPBACK) {
                    //  "Loopback mode is implemented by also
                    // enqueueing the outgoing frame into every local
                    // client's RX queue."
                    let mut echoed = frame;
                    echoed.timestamp_ms = clock::now_ms();
                    echoed.echo = true;
                    session.route_frame(echoed);
                }
            }
            Err(err) => {
                log::warn!(
                    "controller {}: start_xmit rejected frame: {err}",
                    session.controller.id
                );
                session.set_queue_stopped(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::registers::Quirks;
    use crate::mmio::RamRegisters;

    fn virtual_session() -> Arc<DeviceSession> {
        let regs = Arc::new(RamRegisters::new());
        let mut controller = Controller::new(0, regs, Quirks::empty(), 8_000_000, 0, 0);
        controller.mark_virtual_loopback();
        let controller = Arc::new(controller);
        controller.register().unwrap();
        DeviceSession::new(controller, "vcan", 8, 8, 0)
    }

    #[test]
    fn loopback_echo_reaches_every_local_client_once() {
        let session = virtual_session();
        let rx_a = session.open_client(EndpointKind::Rx);
        let rx_b = session.open_client(EndpointKind::Rx);

        let frame = Frame::data_frame(0, 0xABC, false, &[1, 2, 3]);
        session.submit_tx(frame).unwrap();

        let a = rx_a.read().expect("client A should see the echo");
        let b = rx_b.read().expect("client B should see the echo");
        assert_eq!(a.id, 0xABC);
        assert_eq!(b.id, 0xABC);
        assert!(rx_a.read_noblock().is_none(), "frame delivered exactly once");
    }

    #[test]
    fn mid_filter_discriminates_between_frames() {
        let session = virtual_session();
        let rx = session.open_client(EndpointKind::Rx);
        rx.set_mfilter(MidFilter { mask: 0xABC, target: 0xABC }).unwrap();

        session.submit_tx(Frame::data_frame(0, 0xAB1, false, &[])).unwrap();
        session.submit_tx(Frame::data_frame(0, 0xABC, false, &[])).unwrap();

        let got = rx.read().expect("the matching frame should arrive");
        assert_eq!(got.id, 0xABC);
        assert!(rx.read_noblock().is_none());
    }

    #[test]
    fn set_mfilter_on_tx_endpoint_is_rejected() {
        let session = virtual_session();
        let tx = session.open_client(EndpointKind::Tx);
        assert!(matches!(
            tx.set_mfilter(MidFilter::default()),
            Err(DriverError::NotSupported)
        ));
    }

    #[test]
    fn latency_drop_hides_aged_frame_but_not_fresh_one() {
        let session = virtual_session();
        let rx = session.open_client(EndpointKind::Rx);
        rx.set_latency_limit_ms(5);

        session.submit_tx(Frame::data_frame(0, 1, false, &[])).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        session.submit_tx(Frame::data_frame(0, 2, false, &[])).unwrap();

        let got = rx.read().expect("fresh frame should still arrive");
        assert_eq!(got.id, 2);
    }

    #[test]
    fn closing_client_unblocks_a_blocked_reader() {
        let session = virtual_session();
        let rx = session.open_client(EndpointKind::Rx);
        let rx_clone = Arc::clone(&rx);
        let handle = std::thread::spawn(move || rx_clone.read());
        std::thread::sleep(Duration::from_millis(20));
        session.close_client(&rx);
        let result = handle.join().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn tx_dropped_backpressure_is_credited_to_controller_stats() {
        let session = virtual_session();
        for i in 0..20u32 {
            session.submit_tx(Frame::data_frame(0, i, false, &[])).unwrap();
        }
        assert!(session.controller.stats().tx_dropped > 0);
    }
}
