//! Wire frame codec.
//!
//! Every position on the chain exchanges one 8-byte frame per scan cycle. The
//! same layout is used in both directions; the master leaves the feedback bits
//! and the sensor byte clear, satellites fill them in on the way back.
//!
//! ```text
//! byte 0   sensors
//! byte 1   actuator value 3
//! byte 2   actuator value 2
//! byte 3   actuator value 1
//! byte 4   actuator value 0
//! byte 5   mode3[7:5] mode2[4:2] mode1.hi[1:0]
//! byte 6   mode1.lo[7] mode0[6:4] rsvd[3] enable[2] invert_client_crc[1] start_mark[0]
//! byte 7   rsvd[7:6] watchdog_error[5] remote_crc_error[4] crc[3:0]
//! ```

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::crc;

pub const FRAME_BYTES: usize = 8;
pub const FRAME_BITS: usize = FRAME_BYTES * 8;
pub const ACTUATORS_PER_SLOT: usize = 4;

const_assert_eq!(FRAME_BITS, 64);

const MODE_MASK: u8 = 0b111;
const ENABLE_BIT: u8 = 1 << 2;
const INVERT_CLIENT_CRC_BIT: u8 = 1 << 1;
const START_MARK_BIT: u8 = 1 << 0;
const WATCHDOG_ERROR_BIT: u8 = 1 << 5;
const REMOTE_CRC_ERROR_BIT: u8 = 1 << 4;

/// Output mode of one actuator, 3 bits on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActuatorMode {
    #[default]
    Low = 0,
    High = 1,
    Pwm1k25 = 2,
    Pwm100 = 3,
    Pulse = 4,
    PulseInverted = 5,
    // Unassigned codes, carried verbatim
    Reserved6 = 6,
    Reserved7 = 7,
}

impl ActuatorMode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & MODE_MASK {
            0 => ActuatorMode::Low,
            1 => ActuatorMode::High,
            2 => ActuatorMode::Pwm1k25,
            3 => ActuatorMode::Pwm100,
            4 => ActuatorMode::Pulse,
            5 => ActuatorMode::PulseInverted,
            6 => ActuatorMode::Reserved6,
            _ => ActuatorMode::Reserved7,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Logical content of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameFields {
    pub sensors: u8,
    pub actuator_values: [u8; ACTUATORS_PER_SLOT],
    pub actuator_modes: [ActuatorMode; ACTUATORS_PER_SLOT],
    pub enable: bool,
    pub invert_client_crc: bool,
    pub start_mark: bool,
    pub watchdog_error: bool,
    pub remote_crc_error: bool,
}

/// One packed frame as it travels on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireFrame([u8; FRAME_BYTES]);

impl WireFrame {
    pub const fn from_bytes(bytes: [u8; FRAME_BYTES]) -> Self {
        Self(bytes)
    }

    /// Copy a frame out of a contiguous receive buffer.
    ///
    /// Returns `None` if fewer than [`FRAME_BYTES`] bytes are available.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let chunk: [u8; FRAME_BYTES] = bytes.get(..FRAME_BYTES)?.try_into().ok()?;
        Some(Self(chunk))
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_BYTES] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; FRAME_BYTES] {
        &mut self.0
    }

    /// Pack `fields` and seal the frame with a checksum.
    ///
    /// `invalidate_crc` stores the complemented checksum (see [`crc::apply`]).
    pub fn pack(fields: &FrameFields, invalidate_crc: bool) -> Self {
        let modes = fields.actuator_modes.map(ActuatorMode::bits);
        let values = fields.actuator_values;
        let mut b = [0u8; FRAME_BYTES];

        b[0] = fields.sensors;
        b[1] = values[3];
        b[2] = values[2];
        b[3] = values[1];
        b[4] = values[0];
        b[5] = (modes[3] << 5) | (modes[2] << 2) | (modes[1] >> 1);
        b[6] = ((modes[1] & 1) << 7) | (modes[0] << 4);
        if fields.enable {
            b[6] |= ENABLE_BIT;
        }
        if fields.invert_client_crc {
            b[6] |= INVERT_CLIENT_CRC_BIT;
        }
        if fields.start_mark {
            b[6] |= START_MARK_BIT;
        }
        if fields.watchdog_error {
            b[7] |= WATCHDOG_ERROR_BIT;
        }
        if fields.remote_crc_error {
            b[7] |= REMOTE_CRC_ERROR_BIT;
        }

        let mut frame = Self(b);
        crc::apply(&mut frame, invalidate_crc);
        frame
    }

    /// Unpack the frame into its logical fields.
    ///
    /// The second value reports whether the sensor byte differs from
    /// `previous_sensors`, the sensor byte of the last decode for this position.
    pub fn unpack(&self, previous_sensors: u8) -> (FrameFields, bool) {
        let b = &self.0;
        let mode1 = ((b[5] & 0b11) << 1) | (b[6] >> 7);

        let fields = FrameFields {
            sensors: b[0],
            actuator_values: [b[4], b[3], b[2], b[1]],
            actuator_modes: [
                ActuatorMode::from_bits(b[6] >> 4),
                ActuatorMode::from_bits(mode1),
                ActuatorMode::from_bits(b[5] >> 2),
                ActuatorMode::from_bits(b[5] >> 5),
            ],
            enable: b[6] & ENABLE_BIT != 0,
            invert_client_crc: b[6] & INVERT_CLIENT_CRC_BIT != 0,
            start_mark: b[6] & START_MARK_BIT != 0,
            watchdog_error: b[7] & WATCHDOG_ERROR_BIT != 0,
            remote_crc_error: b[7] & REMOTE_CRC_ERROR_BIT != 0,
        };

        (fields, fields.sensors != previous_sensors)
    }

    pub fn crc(&self) -> u8 {
        crc::stored(self)
    }

    pub fn verify(&self) -> bool {
        crc::verify(self)
    }
}
