//! Satellites: one addressable device per chain position.
//!
//! The channel owns all slot state. Callers only ever hold a [`SlotHandle`],
//! which is an address plus a reference back to the channel; every access
//! goes through the channel's locks.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{ChannelError, Shared};
use crate::frame::{ActuatorMode, FrameFields, ACTUATORS_PER_SLOT};
use crate::op_state::{AdminState, OpState};
use crate::stats::SlotStats;

/// Link errors raised against one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusFlags(u8);

impl StatusFlags {
    pub const SYMBOL_ERROR: StatusFlags = StatusFlags(1 << 0);
    pub const SIZE_ERROR: StatusFlags = StatusFlags(1 << 1);
    pub const CRC_ERROR: StatusFlags = StatusFlags(1 << 2);
    pub const REMOTE_CRC_ERROR: StatusFlags = StatusFlags(1 << 3);
    pub const WATCHDOG_ERROR: StatusFlags = StatusFlags(1 << 4);

    pub const fn empty() -> Self {
        StatusFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StatusFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: StatusFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "OK");
        }
        let names = [
            (StatusFlags::SYMBOL_ERROR, "SYMBOL"),
            (StatusFlags::SIZE_ERROR, "SIZE"),
            (StatusFlags::CRC_ERROR, "CRC"),
            (StatusFlags::REMOTE_CRC_ERROR, "REMOTE_CRC"),
            (StatusFlags::WATCHDOG_ERROR, "WATCHDOG"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Receives notifications for one slot.
///
/// Called from the scan thread with no channel lock held, so implementations
/// may call back into the [`SlotHandle`]. They should return quickly; the
/// scan cycle waits for them.
pub trait SlotObserver: Send + Sync {
    /// The slot's error status changed. An empty set means it recovered.
    fn status_update(&self, address: u8, status: StatusFlags);

    /// The sensor byte changed on an error-free cycle.
    fn sense_update(&self, address: u8, sensors: u8);

    fn op_state_update(&self, _address: u8, _state: OpState) {}
}

/// Slot object as stored in the channel's slot table
pub(crate) struct Slot {
    pub(crate) address: u8,
    pub(crate) observer: Option<Arc<dyn SlotObserver>>,
    pub(crate) admin: AdminState,
    pub(crate) op: OpState,
}

impl Slot {
    pub(crate) fn new(address: u8, channel_op: OpState) -> Self {
        let mut op = OpState::WORKING;
        op.set(OpState::CONTROL_BLOCKED, !channel_op.is_working());
        Self {
            address,
            observer: None,
            admin: AdminState::Enabled,
            op,
        }
    }
}

/// Handle to one discovered slot
#[derive(Clone)]
pub struct SlotHandle {
    shared: Arc<Shared>,
    address: u8,
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("channel", &self.shared.config.name)
            .field("address", &self.address)
            .finish()
    }
}

impl SlotHandle {
    pub(crate) fn new(shared: Arc<Shared>, address: u8) -> Self {
        Self { shared, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn index(&self) -> usize {
        usize::from(self.address)
    }

    /// Set one actuator's value and mode. Takes effect on the next scan cycle.
    pub fn set_actuator(
        &self,
        actuator: usize,
        value: u8,
        mode: ActuatorMode,
    ) -> Result<(), ChannelError> {
        if actuator >= ACTUATORS_PER_SLOT {
            return Err(ChannelError::InvalidActuator(actuator));
        }
        let mut tx = self.shared.lock_tx();
        let position = tx.position_mut(self.index())?;
        position.fields.actuator_values[actuator] = value;
        position.fields.actuator_modes[actuator] = mode;
        position.dirty = true;
        Ok(())
    }

    /// Value and mode last written for one actuator
    pub fn actuator(&self, actuator: usize) -> Result<(u8, ActuatorMode), ChannelError> {
        if actuator >= ACTUATORS_PER_SLOT {
            return Err(ChannelError::InvalidActuator(actuator));
        }
        let tx = self.shared.lock_tx();
        let position = tx.position(self.index())?;
        Ok((
            position.fields.actuator_values[actuator],
            position.fields.actuator_modes[actuator],
        ))
    }

    /// Make the master send deliberately broken checksums to this slot
    pub fn set_invert_server_crc(&self, invert: bool) -> Result<(), ChannelError> {
        let mut tx = self.shared.lock_tx();
        let position = tx.position_mut(self.index())?;
        position.invert_server_crc = invert;
        position.dirty = true;
        debug!(address = self.address, invert, "server CRC self-test");
        Ok(())
    }

    /// Ask the satellite to answer with deliberately broken checksums
    pub fn set_invert_client_crc(&self, invert: bool) -> Result<(), ChannelError> {
        let mut tx = self.shared.lock_tx();
        let position = tx.position_mut(self.index())?;
        position.fields.invert_client_crc = invert;
        position.dirty = true;
        debug!(address = self.address, invert, "client CRC self-test");
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), ChannelError> {
        let observer = {
            let mut slots = self.shared.lock_slots();
            let slot = slots
                .get_mut(self.index())
                .ok_or(ChannelError::NoSuchSlot(self.address))?;
            slot.admin = if enabled { AdminState::Enabled } else { AdminState::Disabled };
            slot.op.set(OpState::DISABLED, !enabled);
            slot.observer.clone().map(|o| (o, slot.op))
        };
        self.shared.refresh_enable_bits();
        if let Some((observer, op)) = observer {
            observer.op_state_update(self.address, op);
        }
        Ok(())
    }

    pub fn admin_state(&self) -> Result<AdminState, ChannelError> {
        let slots = self.shared.lock_slots();
        slots
            .get(self.index())
            .map(|slot| slot.admin)
            .ok_or(ChannelError::NoSuchSlot(self.address))
    }

    pub fn op_state(&self) -> Result<OpState, ChannelError> {
        let slots = self.shared.lock_slots();
        slots
            .get(self.index())
            .map(|slot| slot.op)
            .ok_or(ChannelError::NoSuchSlot(self.address))
    }

    /// Sensor byte from the last accepted frame
    pub fn sensors(&self) -> Result<u8, ChannelError> {
        self.feedback().map(|fields| fields.sensors)
    }

    /// Everything decoded from the last accepted frame
    pub fn feedback(&self) -> Result<FrameFields, ChannelError> {
        let rx = self.shared.lock_rx();
        rx.positions
            .get(self.index())
            .filter(|_| self.index() < self.shared.slot_count())
            .map(|position| position.fields)
            .ok_or(ChannelError::NoSuchSlot(self.address))
    }

    pub fn status(&self) -> Result<StatusFlags, ChannelError> {
        let status = self.shared.lock_status();
        status
            .positions
            .get(self.index())
            .filter(|_| self.index() < self.shared.slot_count())
            .map(|position| position.flags)
            .ok_or(ChannelError::NoSuchSlot(self.address))
    }

    pub fn stats(&self, reset: bool) -> Result<SlotStats, ChannelError> {
        if self.index() >= self.shared.slot_count() {
            return Err(ChannelError::NoSuchSlot(self.address));
        }
        let mut status = self.shared.lock_status();
        let position = status
            .positions
            .get_mut(self.index())
            .ok_or(ChannelError::NoSuchSlot(self.address))?;
        let stats = SlotStats {
            address: self.address,
            errors: position.errors,
        };
        if reset {
            position.errors = Default::default();
        }
        Ok(stats)
    }

    pub fn set_observer(&self, observer: Arc<dyn SlotObserver>) -> Result<(), ChannelError> {
        let mut slots = self.shared.lock_slots();
        let slot = slots
            .get_mut(self.index())
            .ok_or(ChannelError::NoSuchSlot(self.address))?;
        slot.observer = Some(observer);
        Ok(())
    }

    pub fn clear_observer(&self) -> Result<(), ChannelError> {
        let mut slots = self.shared.lock_slots();
        let slot = slots
            .get_mut(self.index())
            .ok_or(ChannelError::NoSuchSlot(self.address))?;
        slot.observer = None;
        Ok(())
    }
}
