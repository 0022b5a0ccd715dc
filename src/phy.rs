//! Pulse-timing physical layer.
//!
//! Each bit travels as one pulse: a high phase followed by a low phase. A
//! logical 0 is a short high and a long low, a logical 1 the reverse, so the
//! symbol period is the same for both. Bytes go out MSB first, 8 pulses per
//! byte, 64 pulses per frame.
//!
//! Durations are counted in transceiver ticks. The tolerance windows used by
//! the decoder are part of the channel configuration so they can be
//! calibrated per installation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One captured or generated pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    /// Line level at the start of the pulse
    pub level: bool,
    pub high_ticks: u16,
    pub low_ticks: u16,
}

impl Pulse {
    pub const fn new(high_ticks: u16, low_ticks: u16) -> Self {
        Self {
            level: true,
            high_ticks,
            low_ticks,
        }
    }

    pub fn period(&self) -> u32 {
        u32::from(self.high_ticks) + u32::from(self.low_ticks)
    }
}

/// Inclusive tick range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickWindow {
    pub min: u32,
    pub max: u32,
}

impl TickWindow {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, ticks: u32) -> bool {
        ticks >= self.min && ticks <= self.max
    }

    pub fn overlaps(&self, other: &TickWindow) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PhyError {
    #[error("first pulse started at the wrong line level")]
    LineLevel,
    #[error("pulse {index} outside tolerance (high {high_ticks}, period {period_ticks} ticks)")]
    Symbol {
        index: usize,
        high_ticks: u16,
        period_ticks: u32,
    },
    #[error("transmitter starved before the pulse train completed")]
    TxUnderrun,
    #[error("receive buffer overflowed")]
    RxOverrun,
}

/// Pulse profiles and decoder tolerances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseTiming {
    pub zero: Pulse,
    pub one: Pulse,
    pub short_high: TickWindow,
    pub long_high: TickWindow,
    pub period: TickWindow,
    /// Level the first captured pulse must start with
    pub line_level: bool,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            zero: Pulse::new(6, 14),
            one: Pulse::new(14, 6),
            short_high: TickWindow::new(3, 9),
            long_high: TickWindow::new(11, 17),
            period: TickWindow::new(16, 24),
            line_level: true,
        }
    }
}

impl PulseTiming {
    /// Append up to `bit_count` pulses for `bytes` to `out`.
    ///
    /// Returns the number of pulses written, which is short of `bit_count`
    /// only when `bytes` runs out first.
    pub fn encode(&self, bytes: &[u8], bit_count: usize, out: &mut Vec<Pulse>) -> usize {
        let mut written = 0;

        'bytes: for byte in bytes {
            for bit in (0..8).rev() {
                if written == bit_count {
                    break 'bytes;
                }
                let pulse = if (byte >> bit) & 1 == 1 { self.one } else { self.zero };
                out.push(pulse);
                written += 1;
            }
        }

        written
    }

    /// Decode a capture into `out`, one byte per 8-pulse group.
    ///
    /// Every pulse in the capture is validated; a single bad pulse fails the
    /// whole capture. Returns the number of pulses (bits) received, which the
    /// caller compares against the expected frame size. Bytes that do not fit
    /// in `out` and a trailing partial group are validated but not stored.
    pub fn decode(&self, pulses: &[Pulse], out: &mut [u8]) -> Result<usize, PhyError> {
        let Some(first) = pulses.first() else {
            return Ok(0);
        };
        if first.level != self.line_level {
            return Err(PhyError::LineLevel);
        }

        for (group_index, group) in pulses.chunks(8).enumerate() {
            let mut byte = 0u8;
            for (offset, pulse) in group.iter().enumerate() {
                let bit = self.classify(pulse, group_index * 8 + offset)?;
                byte = (byte << 1) | bit;
            }
            if group.len() == 8 {
                if let Some(slot) = out.get_mut(group_index) {
                    *slot = byte;
                }
            }
        }

        Ok(pulses.len())
    }

    fn classify(&self, pulse: &Pulse, index: usize) -> Result<u8, PhyError> {
        let high = u32::from(pulse.high_ticks);
        let period = pulse.period();
        let symbol_error = PhyError::Symbol {
            index,
            high_ticks: pulse.high_ticks,
            period_ticks: period,
        };

        if !self.period.contains(period) {
            return Err(symbol_error);
        }
        if self.long_high.contains(high) {
            Ok(1)
        } else if self.short_high.contains(high) {
            Ok(0)
        } else {
            Err(symbol_error)
        }
    }

    /// Check the profiles against the windows.
    ///
    /// Both nominal pulses must decode to their own value and the two
    /// high-time windows must not overlap.
    pub fn is_consistent(&self) -> bool {
        !self.short_high.overlaps(&self.long_high)
            && self.short_high.contains(u32::from(self.zero.high_ticks))
            && self.long_high.contains(u32::from(self.one.high_ticks))
            && self.period.contains(self.zero.period())
            && self.period.contains(self.one.period())
    }
}

/// Hardware seam for one link channel.
///
/// `transmit` blocks until the whole pulse train is out. `try_receive` hands
/// back the next buffered capture, or `WouldBlock` while nothing has arrived.
pub trait Transceiver: Send {
    fn transmit(&mut self, pulses: &[Pulse]) -> Result<(), PhyError>;

    fn try_receive(&mut self) -> nb::Result<Vec<Pulse>, PhyError>;

    /// Drop every buffered capture. Returns how many were discarded.
    fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        loop {
            match self.try_receive() {
                Ok(_) => discarded += 1,
                Err(nb::Error::WouldBlock) => return discarded,
                Err(nb::Error::Other(_)) => return discarded,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_consistent() {
        assert!(PulseTiming::default().is_consistent());
    }

    #[test]
    fn test_overlapping_windows_inconsistent() {
        let timing = PulseTiming {
            short_high: TickWindow::new(3, 12),
            ..PulseTiming::default()
        };
        assert!(!timing.is_consistent());
    }

    #[test]
    fn test_encode_msb_first() {
        let timing = PulseTiming::default();
        let mut pulses = Vec::new();
        assert_eq!(timing.encode(&[0b1000_0001], 8, &mut pulses), 8);
        assert_eq!(pulses[0], timing.one);
        assert!(pulses[1..7].iter().all(|p| *p == timing.zero));
        assert_eq!(pulses[7], timing.one);
    }

    #[test]
    fn test_encode_stops_at_bit_count_or_input() {
        let timing = PulseTiming::default();
        let mut pulses = Vec::new();
        assert_eq!(timing.encode(&[0xFF, 0xFF], 12, &mut pulses), 12);
        pulses.clear();
        assert_eq!(timing.encode(&[0xFF], 64, &mut pulses), 8);
    }

    #[test]
    fn test_empty_capture_decodes_to_nothing() {
        let mut out = [0u8; 4];
        assert_eq!(PulseTiming::default().decode(&[], &mut out), Ok(0));
    }

    #[test]
    fn test_wrong_line_level() {
        let timing = PulseTiming::default();
        let mut pulses = Vec::new();
        timing.encode(&[0x42], 8, &mut pulses);
        pulses[0].level = false;

        let mut out = [0u8; 1];
        assert_eq!(timing.decode(&pulses, &mut out), Err(PhyError::LineLevel));
    }

    #[test]
    fn test_period_violation_is_symbol_error() {
        let timing = PulseTiming::default();
        let mut pulses = Vec::new();
        timing.encode(&[0x00], 8, &mut pulses);
        // High time still a valid "0", but the low phase drags the period out
        pulses[3].low_ticks = 40;

        let mut out = [0u8; 1];
        assert!(matches!(
            timing.decode(&pulses, &mut out),
            Err(PhyError::Symbol { index: 3, .. })
        ));
    }
}
