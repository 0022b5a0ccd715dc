//! Simulated satellite chain.
//!
//! [`SimulatedChain`] plays the hardware side of a channel: it decodes the
//! master's pulse train, lets every simulated satellite answer for its own
//! position, forwards the remaining positions untouched and queues the
//! resulting pulse train as the next capture. Optional fault injection uses a
//! fixed-seed generator so runs are reproducible.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::MAX_POSITIONS;
use crate::frame::{FrameFields, WireFrame, FRAME_BITS, FRAME_BYTES};
use crate::phy::{Pulse, PhyError, PulseTiming, Transceiver};

const RNG_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// One simulated satellite
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SimDevice {
    pub sensors: u8,
    pub watchdog_error: bool,
    /// Answer with a broken checksum on every cycle
    pub corrupt_crc: bool,
}

impl SimDevice {
    fn respond(&self, request: &WireFrame) -> WireFrame {
        let (mut fields, _) = request.unpack(0);
        fields.sensors = self.sensors;
        fields.watchdog_error = self.watchdog_error;
        fields.remote_crc_error = !request.verify();
        WireFrame::pack(&fields, fields.invert_client_crc || self.corrupt_crc)
    }
}

/// Random link faults applied to the returned capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Chance per response frame of a flipped payload bit
    pub crc_corruption_percent: f32,
    /// Chance per capture of one pulse landing between the tolerance windows
    pub symbol_error_percent: f32,
    /// Chance per capture of it never arriving
    pub drop_capture_percent: f32,
    /// Cut every capture down to this many frames
    pub truncate_to_frames: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub transmissions: u64,
    pub frames_corrupted: u32,
    pub symbols_corrupted: u32,
    pub captures_dropped: u32,
    pub captures_truncated: u32,
}

#[derive(Debug)]
struct ChainState {
    timing: PulseTiming,
    devices: Vec<SimDevice>,
    faults: FaultInjectionConfig,
    stats: SimulatorStats,
    pending: VecDeque<Vec<Pulse>>,
    last_tx: Vec<FrameFields>,
    rng_state: u64,
}

impl ChainState {
    fn process(&mut self, pulses: &[Pulse]) {
        self.stats.transmissions += 1;

        let mut bytes = [0u8; MAX_POSITIONS * FRAME_BYTES];
        let Ok(bits) = self.timing.decode(pulses, &mut bytes) else {
            trace!("simulator could not decode the master's pulse train");
            return;
        };

        let positions = (bits / FRAME_BITS).min(MAX_POSITIONS);
        self.last_tx.clear();
        let mut response = Vec::with_capacity(positions * FRAME_BYTES);

        for (index, chunk) in bytes.chunks_exact(FRAME_BYTES).take(positions).enumerate() {
            let Some(request) = WireFrame::from_slice(chunk) else {
                break;
            };
            self.last_tx.push(request.unpack(0).0);

            let mut frame = match self.devices.get(index) {
                Some(device) => device.respond(&request),
                None => request,
            };

            if self.faults.enabled && self.should_inject(self.faults.crc_corruption_percent) {
                frame.as_bytes_mut()[1] ^= 1 << (self.random_u8() % 8);
                self.stats.frames_corrupted += 1;
            }
            response.extend_from_slice(frame.as_bytes());
        }

        let mut frames_out = positions;
        if self.faults.enabled {
            if self.should_inject(self.faults.drop_capture_percent) {
                self.stats.captures_dropped += 1;
                return;
            }
            if let Some(limit) = self.faults.truncate_to_frames {
                if limit < frames_out {
                    frames_out = limit;
                    self.stats.captures_truncated += 1;
                }
            }
        }

        let mut capture = Vec::with_capacity(frames_out * FRAME_BITS);
        self.timing.encode(&response, frames_out * FRAME_BITS, &mut capture);

        if self.faults.enabled
            && !capture.is_empty()
            && self.should_inject(self.faults.symbol_error_percent)
        {
            let index = self.random_u32() as usize % capture.len();
            capture[index].high_ticks =
                u16::try_from(self.timing.short_high.max + 1).unwrap_or(u16::MAX);
            self.stats.symbols_corrupted += 1;
        }

        self.pending.push_back(capture);
    }

    fn should_inject(&mut self, rate_percent: f32) -> bool {
        rate_percent > 0.0 && self.random_float() < rate_percent / 100.0
    }

    // Simple LCG, fixed seed
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_u8(&mut self) -> u8 {
        (self.next_random() >> 56) as u8
    }

    fn random_u32(&mut self) -> u32 {
        (self.next_random() >> 32) as u32
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() as f32) / (u64::MAX as f32)
    }
}

/// Transceiver backed by a simulated chain of satellites.
///
/// Clones share the same chain, so a test can keep one handle to steer the
/// devices while the channel owns another.
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    pub fn new(devices: usize) -> Self {
        Self::with_timing(devices, PulseTiming::default())
    }

    pub fn with_timing(devices: usize, timing: PulseTiming) -> Self {
        let state = ChainState {
            timing,
            devices: vec![SimDevice::default(); devices],
            faults: FaultInjectionConfig::default(),
            stats: SimulatorStats::default(),
            pending: VecDeque::new(),
            last_tx: Vec::new(),
            rng_state: RNG_SEED,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Add or remove satellites at the far end of the chain
    pub fn set_device_count(&self, devices: usize) {
        self.lock().devices.resize(devices, SimDevice::default());
    }

    pub fn device(&self, position: usize) -> Option<SimDevice> {
        self.lock().devices.get(position).copied()
    }

    pub fn set_sensors(&self, position: usize, sensors: u8) {
        if let Some(device) = self.lock().devices.get_mut(position) {
            device.sensors = sensors;
        }
    }

    pub fn set_watchdog_error(&self, position: usize, watchdog_error: bool) {
        if let Some(device) = self.lock().devices.get_mut(position) {
            device.watchdog_error = watchdog_error;
        }
    }

    pub fn set_corrupt_crc(&self, position: usize, corrupt: bool) {
        if let Some(device) = self.lock().devices.get_mut(position) {
            device.corrupt_crc = corrupt;
        }
    }

    pub fn set_faults(&self, faults: FaultInjectionConfig) {
        self.lock().faults = faults;
    }

    /// Fields the master sent to `position` in the most recent transmission
    pub fn last_tx_frame(&self, position: usize) -> Option<FrameFields> {
        self.lock().last_tx.get(position).copied()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.lock().stats
    }

    pub fn pending_captures(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Transceiver for SimulatedChain {
    fn transmit(&mut self, pulses: &[Pulse]) -> Result<(), PhyError> {
        self.lock().process(pulses);
        Ok(())
    }

    fn try_receive(&mut self) -> nb::Result<Vec<Pulse>, PhyError> {
        self.lock().pending.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transmit_frames(chain: &mut SimulatedChain, frames: &[WireFrame]) -> Vec<WireFrame> {
        let timing = PulseTiming::default();
        let mut pulses = Vec::new();
        for frame in frames {
            timing.encode(frame.as_bytes(), FRAME_BITS, &mut pulses);
        }
        chain.transmit(&pulses).unwrap();

        let capture = chain.try_receive().unwrap();
        let mut bytes = vec![0u8; capture.len() / 8];
        timing.decode(&capture, &mut bytes).unwrap();
        bytes.chunks_exact(FRAME_BYTES).filter_map(WireFrame::from_slice).collect()
    }

    #[test]
    fn test_device_echoes_inverted_crc_as_remote_error() {
        let mut chain = SimulatedChain::new(1);
        let request = WireFrame::pack(&FrameFields::default(), true);

        let responses = transmit_frames(&mut chain, &[request, request]);
        assert_eq!(responses.len(), 2);

        let (device, _) = responses[0].unpack(0);
        assert!(device.remote_crc_error);
        assert!(responses[0].verify());

        // Empty position hands the master's frame back
        assert_eq!(responses[1], request);
        assert!(!responses[1].unpack(0).0.remote_crc_error);
    }

    #[test]
    fn test_device_reports_sensors_and_keeps_command() {
        let mut chain = SimulatedChain::new(1);
        chain.set_sensors(0, 0x3C);

        let command = FrameFields {
            actuator_values: [200, 0, 0, 0],
            enable: true,
            ..FrameFields::default()
        };
        let responses = transmit_frames(&mut chain, &[WireFrame::pack(&command, false)]);
        let (fields, _) = responses[0].unpack(0);
        assert_eq!(fields.sensors, 0x3C);
        assert_eq!(fields.actuator_values[0], 200);
        assert!(!fields.remote_crc_error);
        assert_eq!(chain.last_tx_frame(0).map(|f| f.actuator_values[0]), Some(200));
    }

    #[test]
    fn test_truncation_shortens_capture() {
        let mut chain = SimulatedChain::new(2);
        chain.set_faults(FaultInjectionConfig {
            enabled: true,
            truncate_to_frames: Some(1),
            ..FaultInjectionConfig::default()
        });

        let frame = WireFrame::pack(&FrameFields::default(), false);
        let responses = transmit_frames(&mut chain, &[frame, frame]);
        assert_eq!(responses.len(), 1);
        assert_eq!(chain.stats().captures_truncated, 1);
    }

    #[test]
    fn test_injection_is_deterministic() {
        let faults = FaultInjectionConfig {
            enabled: true,
            crc_corruption_percent: 30.0,
            ..FaultInjectionConfig::default()
        };
        let frame = WireFrame::pack(&FrameFields::default(), false);

        let run = || {
            let mut chain = SimulatedChain::new(4);
            chain.set_faults(faults.clone());
            for _ in 0..20 {
                transmit_frames(&mut chain, &[frame; 4]);
            }
            chain.stats().frames_corrupted
        };

        let first = run();
        assert!(first > 0);
        assert_eq!(first, run());
    }

    #[test]
    fn test_no_capture_means_would_block() {
        let mut chain = SimulatedChain::new(0);
        assert!(matches!(chain.try_receive(), Err(nb::Error::WouldBlock)));
    }
}
