//! Administrative and operational state.
//!
//! The admin state is what an operator asked for. The operational state is a
//! bitmap of reasons the object is currently not serving; an object is fully
//! working only when no bit is set.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdminState {
    Enabled,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OpState(u8);

impl OpState {
    pub const WORKING: OpState = OpState(0);
    /// Administratively disabled
    pub const DISABLED: OpState = OpState(1 << 0);
    /// Blocked by its own error-rate hysteresis
    pub const ERROR_BLOCKED: OpState = OpState(1 << 1);
    /// Blocked because the owning channel is blocked or down
    pub const CONTROL_BLOCKED: OpState = OpState(1 << 2);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: OpState) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_working(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: OpState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: OpState) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: OpState, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for OpState {
    type Output = OpState;

    fn bitor(self, rhs: OpState) -> OpState {
        OpState(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpState {
    fn bitor_assign(&mut self, rhs: OpState) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_working() {
            return write!(f, "WORKING");
        }
        let names = [
            (OpState::DISABLED, "DISABLED"),
            (OpState::ERROR_BLOCKED, "ERRBLOCK"),
            (OpState::CONTROL_BLOCKED, "CBLOCK"),
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
