//! Component K: driver-selection & probe orchestrator. Collapses the
//! source's `driver_selection_root`/`bar_list_root`/`ioblock_root`
//! process-wide statics into one owned `Driver` value built by `main`
//! (REDESIGN FLAGS "Global mutable state -> owned root").

use std::sync::{Arc, Mutex};

use ahash::RandomState;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::boards::advantech::Advantech;
use crate::boards::ems::Ems;
use crate::boards::fintek::Fintek;
use crate::boards::{kvaser, peak, plx, vcan};
use crate::boards::{Board, BoardFamily};
use crate::config::Config;
use crate::error::{DriverError, Result};
use crate::irq::{IrqDispatcher, IrqLine};
use crate::pci::{PciBus, PciHandle};
use crate::resmgr::Endpoint;
use crate::session::{DeviceSession, EndpointKind};

/// Host-provided interrupt-line primitive factory ("PCI bus
/// enumeration primitives ... assumed to be provided by the host
/// platform"): given the legacy IRQ line number a probed PCI function
/// reports, returns the [`IrqLine`] this crate waits on. Two controllers
/// sharing a legacy line get the same `IrqLine` instance back, which the
/// orchestrator uses to group them onto a single [`IrqDispatcher`]
/// ("Legacy level-triggered IRQs are shared").
pub trait IrqLineFactory: Send + Sync {
    fn line_for(&self, irq_line: u32) -> Arc<dyn IrqLine>;
}

/// Every family in this crate puts at most 4 chips on one card; an
/// inline vector avoids a heap allocation for the common case.
type ControllerIds = SmallVec<[u32; 4]>;

struct BoardEntry {
    board: Board,
    family_name: &'static str,
    controller_ids: ControllerIds,
}

struct DriverState {
    boards: Vec<BoardEntry>,
    next_controller_id: u32,
}

fn default_families() -> Vec<Box<dyn BoardFamily>> {
    vec![
        Box::new(Advantech::new()),
        Box::new(kvaser::family()),
        Box::new(Ems::new()),
        Box::new(peak::family()),
        Box::new(plx::family()),
        Box::new(Fintek::new()),
    ]
}

/// The owned root object. Holds the PCI/IRQ host-platform
/// collaborators, the board-family table, the probed board/controller
/// state, and the lazily created device sessions.
pub struct Driver {
    config: Config,
    pci: Arc<dyn PciBus>,
    irq_factory: Arc<dyn IrqLineFactory>,
    families: Vec<Box<dyn BoardFamily>>,
    state: Mutex<DriverState>,
    dispatchers: Mutex<HashMap<u32, Arc<IrqDispatcher>, RandomState>>,
    device_sessions: Mutex<HashMap<u32, Arc<DeviceSession>, RandomState>>,
    /// Serializes device-session creation/destruction across whichever
    /// resource-manager dispatch thread handles the `open` (a
    /// process-wide mutex `device_session_create_mutex`).
    device_session_create_mutex: Mutex<()>,
}

impl Driver {
    pub fn new(config: Config, pci: Arc<dyn PciBus>, irq_factory: Arc<dyn IrqLineFactory>) -> Result<Arc<Driver>> {
        config.validate()?;
        Ok(Arc::new(Driver {
            config,
            pci,
            irq_factory,
            families: default_families(),
            state: Mutex::new(DriverState {
                boards: Vec::new(),
                next_controller_id: 0,
            }),
            dispatchers: Mutex::new(HashMap::with_hasher(RandomState::new())),
            device_sessions: Mutex::new(HashMap::with_hasher(RandomState::new())),
            device_session_create_mutex: Mutex::new(()),
        }))
    }

    /// `-l`: the board-family table, in probe order.
    pub fn family_names(&self) -> Vec<&'static str> {
        self.families.iter().map(|f| f.name()).collect()
    }

    pub fn controller_ids(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .boards
            .iter()
            .flat_map(|b| b.controller_ids.iter().copied())
            .collect()
    }

    fn family_name_for(&self, controller_id: u32) -> Option<&'static str> {
        let state = self.state.lock().unwrap();
        state
            .boards
            .iter()
            .find(|b| b.controller_ids.contains(&controller_id))
            .map(|b| b.family_name)
    }

    /// `reset_isr` hook wired into every [`IrqDispatcher`]
    /// (`WAKE_THREAD`): runs the quirky-overrun recovery outside the fast
    /// ISR path.
    fn on_wake_thread(controller: &Arc<crate::controller::Controller>) {
        log::warn!("controller {}: WAKE_THREAD requested, resetting", controller.id);
        controller.restart_now();
    }

    /// Walks PCI looking for each family's ids (or just `-d vid:did` if
    /// the config forces one), probes matching boards, wires IRQ
    /// dispatch, then spawns any configured virtual-CAN channels. A probe
    /// failure on one board is logged and skipped; siblings keep
    /// starting.
    pub fn probe_all(self: &Arc<Self>) -> Result<()> {
        for family in &self.families {
            for &id in family.pci_ids() {
                if let Some(forced) = self.config.forced_pci_id {
                    if forced != (id.vendor, id.device) {
                        continue;
                    }
                }
                for handle in self.pci.find_devices(id) {
                    self.probe_one(family.as_ref(), handle);
                }
            }
        }

        if self.config.virtual_channels > 0 {
            self.spawn_virtual_channels(self.config.virtual_channels);
        }

        Ok(())
    }

    fn probe_one(self: &Arc<Self>, family: &dyn BoardFamily, handle: PciHandle) {
        let mut state = self.state.lock().unwrap();
        let first_id = state.next_controller_id;
        drop(state);

        let board = match family.probe(self.pci.as_ref(), handle, first_id) {
            Ok(board) => board,
            Err(err) => {
                log::warn!("{}: probe of PCI handle {:?} failed: {err}", family.name(), handle);
                return;
            }
        };

        let controller_ids: ControllerIds = board.controllers.iter().map(|c| c.id).collect();
        let irq_line = self
            .pci
            .identity(handle)
            .ok()
            .map(|identity| identity.irq_line);

        if let Some(line) = irq_line {
            let dispatcher = self.dispatcher_for_line(line);
            for controller in &board.controllers {
                dispatcher.register(Arc::clone(controller));
            }
        }

        let mut state = self.state.lock().unwrap();
        state.next_controller_id = first_id + controller_ids.len() as u32;
        state.boards.push(BoardEntry {
            board,
            family_name: family.name(),
            controller_ids,
        });
    }

    fn dispatcher_for_line(self: &Arc<Self>, line: u32) -> Arc<IrqDispatcher> {
        let mut dispatchers = self.dispatchers.lock().unwrap();
        if let Some(existing) = dispatchers.get(&line) {
            return Arc::clone(existing);
        }
        let irq_line = self.irq_factory.line_for(line);
        let dispatcher = Arc::new(IrqDispatcher::attach(irq_line, Self::on_wake_thread));
        dispatchers.insert(line, Arc::clone(&dispatcher));
        dispatcher
    }

    fn spawn_virtual_channels(self: &Arc<Self>, count: u32) {
        let mut state = self.state.lock().unwrap();
        let first_id = state.next_controller_id;
        let board = vcan::spawn(count, first_id);
        let controller_ids: ControllerIds = board.controllers.iter().map(|c| c.id).collect();
        state.next_controller_id = first_id + controller_ids.len() as u32;
        state.boards.push(BoardEntry {
            board,
            family_name: "vcan",
            controller_ids,
        });
    }

    fn controller(&self, controller_id: u32) -> Result<Arc<crate::controller::Controller>> {
        let state = self.state.lock().unwrap();
        state
            .boards
            .iter()
            .flat_map(|b| b.board.controllers.iter())
            .find(|c| c.id == controller_id)
            .cloned()
            .ok_or(DriverError::HardwareAbsent)
    }

    /// `open`: lazily creates the device session on first open of any
    /// endpoint of `controller_id` ("Lifecycles"), then opens a new
    /// client session of `kind` on it.
    pub fn open(self: &Arc<Self>, controller_id: u32, kind: EndpointKind) -> Result<Endpoint> {
        let device = self.device_session(controller_id)?;
        Ok(Endpoint::open(device, kind))
    }

    fn device_session(self: &Arc<Self>, controller_id: u32) -> Result<Arc<DeviceSession>> {
        let _guard = self.device_session_create_mutex.lock().unwrap();
        if let Some(existing) = self.device_sessions.lock().unwrap().get(&controller_id) {
            return Ok(Arc::clone(existing));
        }
        let controller = self.controller(controller_id)?;
        let family_name = self.family_name_for(controller_id).unwrap_or("unknown");
        let session = DeviceSession::new(
            controller,
            family_name,
            self.config.tx_queue_capacity,
            self.config.rx_queue_capacity,
            self.config.default_latency_limit_ms);
        self.device_sessions
            .lock()
            .unwrap()
            .insert(controller_id, Arc::clone(&session));
        Ok(session)
    }

    /// Tears every probed board down: shuts down device sessions, drops
    /// IRQ dispatchers (stopping their threads), and releases real PCI
    /// devices (skipped for the virtual-CAN family, which never attached
    /// one).
    pub fn shutdown(&self) {
        for session in self.device_sessions.lock().unwrap().drain().map(|(_, s)| s) {
            session.shutdown();
        }
        self.dispatchers.lock().unwrap().clear();

        let mut state = self.state.lock().unwrap();
        for entry in state.boards.drain(..) {
            if !entry.board.is_virtual {
                self.pci.disable_device(entry.board.handle());
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttachFailure;
    use crate::pci::{PciId, PciIdentity};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Condvar;

    struct NullBus;

    impl PciBus for NullBus {
        fn find_devices(&self, _id: PciId) -> Vec<PciHandle> {
            Vec::new()
        }
        fn identity(&self, _handle: PciHandle) -> Result<PciIdentity> {
            Err(DriverError::HardwareAbsent)
        }
        fn enable_device(&self, _handle: PciHandle) -> Result<()> {
            Err(DriverError::PciAttachFailed(AttachFailure::AlreadyOwned))
        }
        fn disable_device(&self, _handle: PciHandle) {}
        fn map_bar(&self, _handle: PciHandle, _bar_no: u8) -> Result<(u64, usize)> {
            Err(DriverError::IoMapFailed(AttachFailure::NoMemory))
        }
        fn config_read32(&self, _handle: PciHandle, _offset: u16) -> u32 {
            0
        }
        fn config_write32(&self, _handle: PciHandle, _offset: u16, _value: u32) {}
    }

    struct FakeIrqLine {
        state: Mutex<bool>,
        cond: Condvar,
        stopped: AtomicBool,
    }

    impl IrqLine for FakeIrqLine {
        fn wait(&self) -> bool {
            let mut guard = self.state.lock().unwrap();
            while !*guard && !self.stopped.load(Ordering::Acquire) {
                guard = self.cond.wait(guard).unwrap();
            }
            !self.stopped.load(Ordering::Acquire)
        }
        fn request_stop(&self) {
            self.stopped.store(true, Ordering::Release);
            self.cond.notify_all();
        }
    }

    struct NullIrqFactory;

    impl IrqLineFactory for NullIrqFactory {
        fn line_for(&self, _irq_line: u32) -> Arc<dyn IrqLine> {
            Arc::new(FakeIrqLine {
                state: Mutex::new(false),
                cond: Condvar::new(),
                stopped: AtomicBool::new(false),
            })
        }
    }

    fn test_driver(virtual_channels: u32) -> Arc<Driver> {
        let mut config = Config::default();
        config.virtual_channels = virtual_channels;
        Driver::new(config, Arc::new(NullBus), Arc::new(NullIrqFactory)).unwrap()
    }

    #[test]
    fn probe_all_with_no_pci_hardware_spawns_only_virtual_channels() {
        let driver = test_driver(2);
        driver.probe_all().unwrap();
        assert_eq!(driver.controller_ids().len(), 2);
    }

    #[test]
    fn open_lazily_creates_exactly_one_device_session_per_controller() {
        let driver = test_driver(1);
        driver.probe_all().unwrap();
        let id = driver.controller_ids()[0];

        let rx = driver.open(id, EndpointKind::Rx).unwrap();
        let tx = driver.open(id, EndpointKind::Tx).unwrap();
        assert!(Arc::ptr_eq(&rx.device, &tx.device));
    }

    #[test]
    fn open_on_unknown_controller_fails() {
        let driver = test_driver(0);
        driver.probe_all().unwrap();
        assert!(matches!(driver.open(999, EndpointKind::Rx), Err(DriverError::HardwareAbsent)));
    }

    #[test]
    fn shutdown_tears_down_every_device_session() {
        let driver = test_driver(1);
        driver.probe_all().unwrap();
        let id = driver.controller_ids()[0];
        let ep = driver.open(id, EndpointKind::Rx).unwrap();
        driver.shutdown();
        assert!(ep.client.read().is_none());
    }
}
