//! The cyclic scan: build, transmit, receive, classify, notify.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::channel::Shared;
use crate::config::MAX_POSITIONS;
use crate::frame::{FrameFields, WireFrame, FRAME_BITS, FRAME_BYTES};
use crate::health::HealthTransition;
use crate::phy::{Pulse, Transceiver};
use crate::slot::{SlotObserver, StatusFlags};
use crate::stats::{ErrorCounts, ErrorKind};

const RECEIVE_POLL: Duration = Duration::from_micros(50);

/// State of one CRC self-test.
///
/// Switching a test off does not end suppression immediately: frames sent
/// while the test was on may still be in flight, so errors stay suppressed for
/// a configurable number of trailing cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrcSelfTest {
    #[default]
    Inactive,
    Active,
    /// Cycles left before the test is fully off
    Deactivating(u8),
}

impl CrcSelfTest {
    /// Advance one cycle given whether the test is currently requested.
    pub fn step(self, requested: bool, trailing_cycles: u8) -> Self {
        match (self, requested) {
            (_, true) => CrcSelfTest::Active,
            (CrcSelfTest::Inactive, false) => CrcSelfTest::Inactive,
            (CrcSelfTest::Active, false) if trailing_cycles == 0 => CrcSelfTest::Inactive,
            (CrcSelfTest::Active, false) => CrcSelfTest::Deactivating(trailing_cycles),
            (CrcSelfTest::Deactivating(n), false) if n <= 1 => CrcSelfTest::Inactive,
            (CrcSelfTest::Deactivating(n), false) => CrcSelfTest::Deactivating(n - 1),
        }
    }

    pub fn is_suppressing(self) -> bool {
        self != CrcSelfTest::Inactive
    }
}

/// What one scan cycle saw
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Positions transmitted this cycle
    pub positions: usize,
    pub received_bits: usize,
    /// Size or symbol error affecting the whole cycle
    pub cycle_error: Option<StatusFlags>,
    /// Raw decoded responses, empty when `cycle_error` is set
    pub responses: ArrayVec<FrameFields, MAX_POSITIONS>,
    /// Errors counted against the channel during this cycle
    pub new_errors: ErrorCounts,
    pub health: HealthTransition,
}

#[derive(Debug, Clone, Copy, Default)]
struct Suppression {
    remote_crc: bool,
    rx_crc: bool,
}

#[derive(Debug, Default)]
struct FrameBatch {
    frames: ArrayVec<WireFrame, MAX_POSITIONS>,
    suppress: [Suppression; MAX_POSITIONS],
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Status(StatusFlags),
    Sense(u8),
}

impl Shared {
    /// Snapshot the TX table into one batch of frames, repacking the dirty ones.
    fn build_frames(&self) -> FrameBatch {
        let trailing = self.config.crc_test_trailing_cycles;
        let mut batch = FrameBatch::default();
        let mut tx = self.lock_tx();
        let active = tx.active;

        for (index, position) in tx.positions[..active].iter_mut().enumerate() {
            let start_mark = index == 0;
            if position.fields.start_mark != start_mark {
                position.fields.start_mark = start_mark;
                position.dirty = true;
            }

            position.server_test = position
                .server_test
                .step(position.invert_server_crc, trailing);
            position.client_test = position
                .client_test
                .step(position.fields.invert_client_crc, trailing);

            if position.dirty {
                position.frame = WireFrame::pack(&position.fields, position.invert_server_crc);
                position.dirty = false;
            }

            let pushed = batch.frames.try_push(position.frame);
            debug_assert!(pushed.is_ok(), "active positions exceed MAX_POSITIONS");
            batch.suppress[index] = Suppression {
                remote_crc: position.server_test.is_suppressing(),
                rx_crc: position.client_test.is_suppressing(),
            };
        }

        batch
    }

    /// Wait for the capture of the frames just sent.
    ///
    /// A timeout yields an empty capture. `None` means the receiver itself
    /// failed and the failure has already been counted.
    fn receive(
        &self,
        transceiver: &mut dyn Transceiver,
        counts: &mut ErrorCounts,
    ) -> Option<Vec<Pulse>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.receive_timeout_ms);
        loop {
            match transceiver.try_receive() {
                Ok(capture) => return Some(capture),
                Err(nb::Error::WouldBlock) => {
                    if Instant::now() >= deadline {
                        debug!("no capture before receive timeout");
                        return Some(Vec::new());
                    }
                    thread::sleep(RECEIVE_POLL);
                }
                Err(nb::Error::Other(e)) => {
                    warn!(error = %e, "receive failed");
                    counts.add(ErrorKind::RxOverrun, 1);
                    return None;
                }
            }
        }
    }

    /// Run one complete scan cycle.
    pub(crate) fn scan_cycle(&self) -> CycleReport {
        let batch = self.build_frames();
        let active = batch.frames.len();
        let expected_bits = active * FRAME_BITS;

        let mut counts = ErrorCounts::default();
        let mut rx_bytes = [0u8; MAX_POSITIONS * FRAME_BYTES];
        let mut received_bits = 0;
        let mut cycle_error = None;

        if active > 0 {
            let mut pulses = Vec::with_capacity(expected_bits);
            for frame in &batch.frames {
                self.config.timing.encode(frame.as_bytes(), FRAME_BITS, &mut pulses);
            }

            let mut transceiver = self.lock_transceiver();
            let capture = match transceiver.transmit(&pulses) {
                Ok(()) => self.receive(&mut **transceiver, &mut counts),
                Err(e) => {
                    warn!(error = %e, "transmit failed");
                    counts.add(ErrorKind::TxUnderrun, 1);
                    None
                }
            };

            match capture.map(|capture| self.config.timing.decode(&capture, &mut rx_bytes)) {
                // A transceiver fault is counted once, under its own kind.
                // Slots still see the missing feedback as a size error.
                None => cycle_error = Some(StatusFlags::SIZE_ERROR),
                Some(Ok(bits)) => {
                    received_bits = bits;
                    if bits != expected_bits {
                        debug!(bits, expected_bits, "size error");
                        cycle_error = Some(StatusFlags::SIZE_ERROR);
                        counts.add(ErrorKind::RxSizeError, 1);
                    }
                }
                Some(Err(e)) => {
                    let discarded = transceiver.discard_pending();
                    debug!(error = %e, discarded, "symbol error");
                    cycle_error = Some(StatusFlags::SYMBOL_ERROR);
                    counts.add(ErrorKind::RxSymbolError, 1);
                }
            }
        }

        let mut responses = ArrayVec::new();
        let mut events: heapless::Vec<(u8, Event), { MAX_POSITIONS * 2 }> = heapless::Vec::new();
        {
            let mut rx = self.lock_rx();
            let mut status = self.lock_status();

            for (index, chunk) in rx_bytes.chunks_exact(FRAME_BYTES).take(active).enumerate() {
                let address = index as u8;
                let mut raised = StatusFlags::empty();
                let mut sense = None;

                match cycle_error {
                    Some(flag) => raised = flag,
                    None => {
                        let mut bytes = [0u8; FRAME_BYTES];
                        bytes.copy_from_slice(chunk);
                        let frame = WireFrame::from_bytes(bytes);
                        let suppress = batch.suppress[index];

                        let crc_ok = frame.verify();
                        let stored = rx.positions[index].fields.sensors;
                        let (fields, changed) = frame.unpack(stored);
                        let pushed = responses.try_push(fields);
                        debug_assert!(pushed.is_ok(), "more responses than positions");

                        if !crc_ok && !suppress.rx_crc {
                            raised |= StatusFlags::CRC_ERROR;
                        }
                        if fields.remote_crc_error && !suppress.remote_crc {
                            raised |= StatusFlags::REMOTE_CRC_ERROR;
                        }
                        if fields.watchdog_error {
                            raised |= StatusFlags::WATCHDOG_ERROR;
                        }
                        if crc_ok || suppress.rx_crc {
                            // Sensors only move on a clean frame, so a change
                            // seen alongside an error is reported once the
                            // error clears
                            let mut accepted = fields;
                            if !raised.is_empty() {
                                accepted.sensors = stored;
                            } else if changed {
                                sense = Some(fields.sensors);
                            }
                            rx.positions[index].fields = accepted;
                        }
                    }
                }

                let position = &mut status.positions[index];
                if !raised.is_empty() {
                    if !position.dirty {
                        position.dirty = true;
                        position.flags = raised;
                        for kind in ErrorKind::from_status(raised) {
                            position.errors.add(kind, 1);
                            // Cycle-level errors are already counted once above
                            if cycle_error.is_none() {
                                counts.add(kind, 1);
                            }
                        }
                        debug!(address, status = %raised, "slot error raised");
                        let pushed = events.push((address, Event::Status(raised)));
                        debug_assert!(pushed.is_ok(), "event buffer full");
                    }
                    continue;
                }

                if position.dirty {
                    let cleared = position.flags;
                    position.dirty = false;
                    position.flags = StatusFlags::empty();
                    if !cleared.is_empty() {
                        debug!(address, cleared = %cleared, "slot recovered");
                        let pushed = events.push((address, Event::Status(StatusFlags::empty())));
                        debug_assert!(pushed.is_ok(), "event buffer full");
                    }
                }
                if let Some(sensors) = sense {
                    let pushed = events.push((address, Event::Sense(sensors)));
                    debug_assert!(pushed.is_ok(), "event buffer full");
                }
            }
        }

        let health = {
            let mut counters = self.lock_counters();
            counters.record_all(&counts);
            counters.record_cycle();
            self.lock_health().evaluate(Instant::now(), &mut counters)
        };
        self.apply_health(health);
        self.dispatch(&events);

        CycleReport {
            positions: active,
            received_bits,
            cycle_error,
            responses,
            new_errors: counts,
            health,
        }
    }

    fn dispatch(&self, events: &[(u8, Event)]) {
        if events.is_empty() {
            return;
        }

        let mut targets: heapless::Vec<(Arc<dyn SlotObserver>, u8, Event), { MAX_POSITIONS * 2 }> =
            heapless::Vec::new();
        {
            let slots = self.lock_slots();
            for &(address, event) in events {
                let observer = slots
                    .get(usize::from(address))
                    .and_then(|slot| slot.observer.clone());
                if let Some(observer) = observer {
                    let pushed = targets.push((observer, address, event));
                    debug_assert!(pushed.is_ok(), "observer buffer full");
                }
            }
        }

        for (observer, address, event) in targets {
            match event {
                Event::Status(status) => observer.status_update(address, status),
                Event::Sense(sensors) => observer.sense_update(address, sensors),
            }
        }
    }

    /// Body of the scan thread. Runs until the stop flag is raised.
    ///
    /// Cycles start on a fixed period. A cycle that overruns its slot is
    /// counted as a timing violation and the schedule restarts from now
    /// instead of trying to catch up.
    pub(crate) fn scan_loop(&self) {
        let span = info_span!("satlink", channel = %self.config.name);
        let _enter = span.enter();

        let interval = Duration::from_millis(self.config.scan_interval_ms);
        let mut next = Instant::now();
        info!(interval_ms = self.config.scan_interval_ms, "scan loop started");

        while !self.stop.load(Ordering::Acquire) {
            self.scan_cycle();

            next += interval;
            let now = Instant::now();
            if next <= now {
                self.lock_counters().record(ErrorKind::ScanTimingViolation);
                debug!(late_us = (now - next).as_micros() as u64, "scan cycle overran");
                next = now;
            } else {
                thread::sleep(next - now);
            }
        }

        info!("scan loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_activates_immediately() {
        assert_eq!(CrcSelfTest::Inactive.step(true, 2), CrcSelfTest::Active);
        assert_eq!(CrcSelfTest::Deactivating(1).step(true, 2), CrcSelfTest::Active);
        assert_eq!(CrcSelfTest::Inactive.step(false, 2), CrcSelfTest::Inactive);
    }

    #[test]
    fn test_self_test_trailing_cycles() {
        let mut state = CrcSelfTest::Active.step(false, 2);
        assert_eq!(state, CrcSelfTest::Deactivating(2));
        assert!(state.is_suppressing());

        state = state.step(false, 2);
        assert_eq!(state, CrcSelfTest::Deactivating(1));
        assert!(state.is_suppressing());

        state = state.step(false, 2);
        assert_eq!(state, CrcSelfTest::Inactive);
        assert!(!state.is_suppressing());
    }

    #[test]
    fn test_self_test_without_trailing_cycles() {
        assert_eq!(CrcSelfTest::Active.step(false, 0), CrcSelfTest::Inactive);
    }
}
