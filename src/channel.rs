//! One satellite link channel.
//!
//! A [`Channel`] owns the transceiver, the per-position TX/RX/status tables,
//! the performance counters and the health hysteresis. While enabled it runs
//! the scan loop on its own thread; everything else reaches the link state
//! through short, blocking lock scopes. Lock order when two are held at once
//! is rx before status, counters before health, and state before slots before
//! tx. No table lock is held across transceiver I/O or while calling an
//! observer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{
    validate_thresholds, ChannelConfig, ConfigError, ErrorThresholds, MAX_POSITIONS, MAX_SATELLITES,
};
use crate::discovery::DiscoveryError;
use crate::frame::{FrameFields, WireFrame};
use crate::health::{HealthMonitor, HealthTransition};
use crate::op_state::{AdminState, OpState};
use crate::phy::Transceiver;
use crate::scan::{CrcSelfTest, CycleReport};
use crate::slot::{Slot, SlotHandle, StatusFlags};
use crate::stats::{ChannelStats, ErrorCounts, PerformanceCounters, SlotStats};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Operation not allowed in the current admin state. Nothing was changed.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("actuator index {0} out of range")]
    InvalidActuator(usize),
    #[error("no satellite at address {0}")]
    NoSuchSlot(u8),
    #[error("failed to start scan thread: {0}")]
    Spawn(String),
}

/// TX side of one link position
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TxPosition {
    pub(crate) fields: FrameFields,
    pub(crate) invert_server_crc: bool,
    pub(crate) server_test: CrcSelfTest,
    pub(crate) client_test: CrcSelfTest,
    /// Fields changed since the frame was last packed
    pub(crate) dirty: bool,
    pub(crate) frame: WireFrame,
}

#[derive(Debug)]
pub(crate) struct TxTable {
    pub(crate) positions: [TxPosition; MAX_POSITIONS],
    /// Positions scanned per cycle
    pub(crate) active: usize,
}

impl TxTable {
    fn new() -> Self {
        Self {
            positions: [TxPosition::default(); MAX_POSITIONS],
            active: 0,
        }
    }

    pub(crate) fn position(&self, index: usize) -> Result<&TxPosition, ChannelError> {
        if index >= self.active {
            return Err(ChannelError::NoSuchSlot(index as u8));
        }
        Ok(&self.positions[index])
    }

    pub(crate) fn position_mut(&mut self, index: usize) -> Result<&mut TxPosition, ChannelError> {
        if index >= self.active {
            return Err(ChannelError::NoSuchSlot(index as u8));
        }
        Ok(&mut self.positions[index])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RxPosition {
    pub(crate) fields: FrameFields,
}

#[derive(Debug)]
pub(crate) struct RxTable {
    pub(crate) positions: [RxPosition; MAX_POSITIONS],
}

/// Error status of one position
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PositionStatus {
    pub(crate) flags: StatusFlags,
    /// Set once an error has been reported; further errors are suppressed
    /// until a clean cycle clears it
    pub(crate) dirty: bool,
    pub(crate) errors: ErrorCounts,
}

#[derive(Debug)]
pub(crate) struct StatusTable {
    pub(crate) positions: [PositionStatus; MAX_POSITIONS],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelState {
    pub(crate) admin: AdminState,
    pub(crate) op: OpState,
}

pub(crate) type SlotTable = heapless::Vec<Slot, MAX_SATELLITES>;

/// State shared between the owning [`Channel`], its scan thread and every
/// [`SlotHandle`]
pub(crate) struct Shared {
    pub(crate) config: ChannelConfig,
    tx: Mutex<TxTable>,
    rx: Mutex<RxTable>,
    status: Mutex<StatusTable>,
    counters: Mutex<PerformanceCounters>,
    health: Mutex<HealthMonitor>,
    slots: Mutex<SlotTable>,
    state: Mutex<ChannelState>,
    transceiver: Mutex<Box<dyn Transceiver>>,
    slot_count: AtomicUsize,
    pub(crate) stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn lock_tx(&self) -> MutexGuard<'_, TxTable> {
        lock(&self.tx)
    }

    pub(crate) fn lock_rx(&self) -> MutexGuard<'_, RxTable> {
        lock(&self.rx)
    }

    pub(crate) fn lock_status(&self) -> MutexGuard<'_, StatusTable> {
        lock(&self.status)
    }

    pub(crate) fn lock_counters(&self) -> MutexGuard<'_, PerformanceCounters> {
        lock(&self.counters)
    }

    pub(crate) fn lock_health(&self) -> MutexGuard<'_, HealthMonitor> {
        lock(&self.health)
    }

    pub(crate) fn lock_slots(&self) -> MutexGuard<'_, SlotTable> {
        lock(&self.slots)
    }

    pub(crate) fn lock_transceiver(&self) -> MutexGuard<'_, Box<dyn Transceiver>> {
        lock(&self.transceiver)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count.load(Ordering::Acquire)
    }

    pub(crate) fn channel_op(&self) -> OpState {
        lock(&self.state).op
    }

    /// Drop every slot object. Handles already given out turn stale.
    pub(crate) fn teardown_slots(&self) {
        let mut slots = self.lock_slots();
        slots.clear();
        self.slot_count.store(0, Ordering::Release);
    }

    /// Create slot objects for addresses `0..count`
    pub(crate) fn populate_slots(&self, count: usize) {
        let state = lock(&self.state);
        let mut slots = self.lock_slots();
        slots.clear();
        for address in 0..count.min(MAX_SATELLITES) {
            let pushed = slots.push(Slot::new(address as u8, state.op));
            debug_assert!(pushed.is_ok(), "slot table full");
        }
        self.slot_count.store(slots.len(), Ordering::Release);
    }

    /// Recompute the TX `enable` bit of every position from slot admin and
    /// op state. Positions without a slot object transmit disabled.
    pub(crate) fn refresh_enable_bits(&self) {
        let mut enabled = [false; MAX_POSITIONS];
        {
            let slots = self.lock_slots();
            for slot in slots.iter() {
                enabled[usize::from(slot.address)] =
                    slot.admin == AdminState::Enabled && slot.op.is_working();
            }
        }

        let mut tx = self.lock_tx();
        for (position, enable) in tx.positions.iter_mut().zip(enabled) {
            if position.fields.enable != enable {
                position.fields.enable = enable;
                position.dirty = true;
            }
        }
    }

    /// Change the channel admin and op state and cascade control-block to
    /// every slot.
    ///
    /// The state lock is held until the slots and TX enable bits match the new
    /// op state.
    pub(crate) fn update_channel_state(
        &self,
        update: impl FnOnce(&mut ChannelState),
    ) -> ChannelState {
        let mut changed: heapless::Vec<_, MAX_SATELLITES> = heapless::Vec::new();
        let after = {
            let mut state = lock(&self.state);
            let before = state.op;
            update(&mut *state);
            if state.op == before {
                return *state;
            }
            info!(
                channel = %self.config.name,
                from = %before,
                to = %state.op,
                "channel op state changed"
            );

            {
                let mut slots = self.lock_slots();
                for slot in slots.iter_mut() {
                    let before = slot.op;
                    slot.op.set(OpState::CONTROL_BLOCKED, !state.op.is_working());
                    if slot.op != before {
                        if let Some(observer) = slot.observer.clone() {
                            let pushed = changed.push((observer, slot.address, slot.op));
                            debug_assert!(pushed.is_ok(), "more changes than slots");
                        }
                    }
                }
            }
            self.refresh_enable_bits();
            *state
        };

        for (observer, address, slot_op) in changed {
            observer.op_state_update(address, slot_op);
        }
        after
    }

    pub(crate) fn update_channel_op(&self, update: impl FnOnce(&mut OpState)) -> OpState {
        self.update_channel_state(|state| update(&mut state.op)).op
    }

    pub(crate) fn apply_health(&self, transition: HealthTransition) {
        match transition {
            HealthTransition::Unchanged => {}
            HealthTransition::Blocked => {
                warn!(channel = %self.config.name, "error rate above threshold, blocking channel");
                self.update_channel_op(|op| op.insert(OpState::ERROR_BLOCKED));
            }
            HealthTransition::Unblocked => {
                info!(channel = %self.config.name, "error rate recovered, unblocking channel");
                self.update_channel_op(|op| op.remove(OpState::ERROR_BLOCKED));
            }
        }
    }
}

/// A satellite link channel
pub struct Channel {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        transceiver: impl Transceiver + 'static,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let health = HealthMonitor::new(config.error_thresholds, Instant::now());

        let shared = Shared {
            tx: Mutex::new(TxTable::new()),
            rx: Mutex::new(RxTable {
                positions: [RxPosition::default(); MAX_POSITIONS],
            }),
            status: Mutex::new(StatusTable {
                positions: [PositionStatus::default(); MAX_POSITIONS],
            }),
            counters: Mutex::new(PerformanceCounters::new()),
            health: Mutex::new(health),
            slots: Mutex::new(heapless::Vec::new()),
            state: Mutex::new(ChannelState {
                admin: AdminState::Disabled,
                op: OpState::DISABLED,
            }),
            transceiver: Mutex::new(Box::new(transceiver)),
            slot_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Discover the chain and start the scan loop.
    ///
    /// Returns the number of satellites found. On a discovery failure the
    /// channel stays disabled.
    pub fn enable(&self) -> Result<usize, ChannelError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(ChannelError::InvalidState("channel is already enabled"));
        }

        let found = self.shared.discover()?;

        // Slots go live before the first scan cycle
        self.shared.update_channel_state(|state| {
            state.admin = AdminState::Enabled;
            state.op.remove(OpState::DISABLED);
        });

        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("satlink-{}", self.name()))
            .spawn(move || shared.scan_loop());
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                warn!(channel = %self.name(), error = %e, "failed to start scan thread");
                self.shared.update_channel_state(|state| {
                    state.admin = AdminState::Disabled;
                    state.op.insert(OpState::DISABLED);
                });
                return Err(ChannelError::Spawn(e.to_string()));
            }
        }

        info!(channel = %self.name(), satellites = found, "channel enabled");
        Ok(found)
    }

    /// Stop the scan loop once the current cycle has completed.
    pub fn disable(&self) -> Result<(), ChannelError> {
        let mut worker = lock(&self.worker);
        let handle = worker.take().ok_or(ChannelError::InvalidState("channel is not enabled"))?;
        self.stop_and_join(handle);
        Ok(())
    }

    fn stop_and_join(&self, handle: JoinHandle<()>) {
        self.shared.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!(channel = %self.name(), "scan thread panicked");
        }
        self.shared.update_channel_state(|state| {
            state.admin = AdminState::Disabled;
            state.op.insert(OpState::DISABLED);
        });
        info!(channel = %self.name(), "channel disabled");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Re-run bus discovery. Only allowed while the scan loop is stopped.
    pub fn discover(&self) -> Result<usize, ChannelError> {
        let worker = lock(&self.worker);
        if worker.is_some() {
            return Err(DiscoveryError::InvalidState.into());
        }
        Ok(self.shared.discover()?)
    }

    /// Run exactly one scan cycle on the calling thread.
    ///
    /// Only allowed while the scan loop is stopped. The cycle does not wait for
    /// a scan period and never counts a timing violation.
    pub fn run_cycle(&self) -> Result<CycleReport, ChannelError> {
        let worker = lock(&self.worker);
        if worker.is_some() {
            return Err(ChannelError::InvalidState("scan loop is running"));
        }
        Ok(self.shared.scan_cycle())
    }

    pub fn set_error_thresholds(&self, high: u32, low: u32) -> Result<(), ChannelError> {
        let thresholds = ErrorThresholds::new(high, low);
        validate_thresholds(thresholds)?;
        self.shared.lock_health().set_thresholds(thresholds);
        info!(channel = %self.name(), high, low, "error thresholds updated");
        Ok(())
    }

    pub fn error_thresholds(&self) -> ErrorThresholds {
        self.shared.lock_health().thresholds()
    }

    /// Snapshot of the channel and per-slot counters, optionally clearing the
    /// lifetime totals afterwards.
    pub fn stats(&self, reset: bool) -> ChannelStats {
        let slot_count = self.shared.slot_count();
        let slots = {
            let mut status = self.shared.lock_status();
            status.positions[..slot_count]
                .iter_mut()
                .enumerate()
                .map(|(address, position)| {
                    let stats = SlotStats {
                        address: address as u8,
                        errors: position.errors,
                    };
                    if reset {
                        position.errors = ErrorCounts::default();
                    }
                    stats
                })
                .collect()
        };

        let mut counters = self.shared.lock_counters();
        let stats = ChannelStats {
            cycles: counters.cycles(),
            lifetime: *counters.lifetime(),
            this_second: *counters.this_second(),
            slots,
        };
        if reset {
            counters.reset_lifetime();
        }
        stats
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slot_count()
    }

    pub fn slot(&self, address: u8) -> Option<SlotHandle> {
        (usize::from(address) < self.slot_count())
            .then(|| SlotHandle::new(Arc::clone(&self.shared), address))
    }

    pub fn slots(&self) -> Vec<SlotHandle> {
        (0..self.slot_count())
            .map(|address| SlotHandle::new(Arc::clone(&self.shared), address as u8))
            .collect()
    }

    pub fn admin_state(&self) -> AdminState {
        lock(&self.shared.state).admin
    }

    pub fn op_state(&self) -> OpState {
        self.shared.channel_op()
    }

    /// Times the health hysteresis has blocked this channel
    pub fn block_count(&self) -> u32 {
        self.shared.lock_health().block_count()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            self.stop_and_join(handle);
        }
    }
}
