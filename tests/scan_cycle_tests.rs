use satlink::*;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Note {
    Status(StatusFlags),
    Sense(u8),
}

#[derive(Default)]
struct Recorder {
    notes: Mutex<Vec<(u8, Note)>>,
}

impl Recorder {
    fn take(&self) -> Vec<(u8, Note)> {
        std::mem::take(&mut *self.notes.lock().unwrap())
    }
}

impl SlotObserver for Recorder {
    fn status_update(&self, address: u8, status: StatusFlags) {
        self.notes.lock().unwrap().push((address, Note::Status(status)));
    }

    fn sense_update(&self, address: u8, sensors: u8) {
        self.notes.lock().unwrap().push((address, Note::Sense(sensors)));
    }
}

fn setup(devices: usize) -> (Channel, SimulatedChain, Arc<Recorder>) {
    let config = ChannelConfig {
        name: "scan".to_string(),
        max_satellites: 4,
        discovery_settle_ms: 1,
        receive_timeout_ms: 2,
        crc_test_trailing_cycles: 2,
        ..ChannelConfig::default()
    };
    let chain = SimulatedChain::new(devices);
    let channel = Channel::new(config, chain.clone()).unwrap();
    assert_eq!(channel.discover().unwrap(), devices);

    let recorder = Arc::new(Recorder::default());
    for slot in channel.slots() {
        slot.set_observer(recorder.clone()).unwrap();
    }
    (channel, chain, recorder)
}

#[test]
fn test_clean_cycle_against_echoing_chain() {
    let (channel, chain, recorder) = setup(2);
    let slot = channel.slot(0).unwrap();
    slot.set_actuator(0, 200, ActuatorMode::High).unwrap();

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.positions, 2);
    assert_eq!(report.received_bits, 128);
    assert_eq!(report.cycle_error, None);
    assert!(report.new_errors.is_empty());
    assert!(recorder.take().is_empty());

    let sent = chain.last_tx_frame(0).unwrap();
    assert_eq!(sent.actuator_values[0], 200);
    assert_eq!(sent.actuator_modes[0], ActuatorMode::High);
    assert_eq!(slot.actuator(0).unwrap(), (200, ActuatorMode::High));
    assert_eq!(slot.feedback().unwrap().actuator_values[0], 200);
    assert_eq!(slot.status().unwrap(), StatusFlags::empty());
}

#[test]
fn test_sense_update_only_on_change() {
    let (channel, chain, recorder) = setup(2);

    chain.set_sensors(1, 0x05);
    channel.run_cycle().unwrap();
    assert_eq!(recorder.take(), vec![(1, Note::Sense(0x05))]);
    assert_eq!(channel.slot(1).unwrap().sensors().unwrap(), 0x05);

    channel.run_cycle().unwrap();
    assert!(recorder.take().is_empty());

    chain.set_sensors(1, 0x04);
    chain.set_sensors(0, 0x80);
    channel.run_cycle().unwrap();
    assert_eq!(recorder.take(), vec![(0, Note::Sense(0x80)), (1, Note::Sense(0x04))]);
}

#[test]
fn test_sense_change_during_error_reported_after_recovery() {
    let (channel, chain, recorder) = setup(1);
    let slot = channel.slot(0).unwrap();

    chain.set_watchdog_error(0, true);
    chain.set_sensors(0, 0x05);
    channel.run_cycle().unwrap();
    assert_eq!(recorder.take(), vec![(0, Note::Status(StatusFlags::WATCHDOG_ERROR))]);
    assert_eq!(slot.sensors().unwrap(), 0);

    chain.set_watchdog_error(0, false);
    channel.run_cycle().unwrap();
    assert_eq!(
        recorder.take(),
        vec![(0, Note::Status(StatusFlags::empty())), (0, Note::Sense(0x05))]
    );
    assert_eq!(slot.sensors().unwrap(), 0x05);

    channel.run_cycle().unwrap();
    assert!(recorder.take().is_empty());
}

#[test]
fn test_size_mismatch_skips_classification() {
    let (channel, chain, recorder) = setup(2);
    chain.set_watchdog_error(0, true);
    chain.set_faults(FaultInjectionConfig {
        enabled: true,
        truncate_to_frames: Some(1),
        ..FaultInjectionConfig::default()
    });

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.received_bits, 64);
    assert_eq!(report.cycle_error, Some(StatusFlags::SIZE_ERROR));
    assert_eq!(report.new_errors.rx_size_error, 1);
    assert_eq!(report.new_errors.rx_crc_error, 0);
    assert_eq!(report.new_errors.watchdog_error, 0);

    let stats = channel.stats(false);
    assert_eq!(stats.lifetime.rx_size_error, 1);
    assert_eq!(stats.lifetime.rx_crc_error, 0);

    assert_eq!(
        recorder.take(),
        vec![
            (0, Note::Status(StatusFlags::SIZE_ERROR)),
            (1, Note::Status(StatusFlags::SIZE_ERROR)),
        ]
    );
    assert_eq!(channel.slot(1).unwrap().status().unwrap(), StatusFlags::SIZE_ERROR);
}

#[test]
fn test_watchdog_raise_and_recovery() {
    let (channel, chain, recorder) = setup(3);
    chain.set_watchdog_error(2, true);

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.new_errors.watchdog_error, 1);
    assert_eq!(recorder.take(), vec![(2, Note::Status(StatusFlags::WATCHDOG_ERROR))]);

    // Already reported: neither counted nor notified again
    let report = channel.run_cycle().unwrap();
    assert!(report.new_errors.is_empty());
    assert!(recorder.take().is_empty());

    chain.set_watchdog_error(2, false);
    channel.run_cycle().unwrap();
    assert_eq!(recorder.take(), vec![(2, Note::Status(StatusFlags::empty()))]);

    let slot = channel.slot(2).unwrap();
    assert_eq!(slot.status().unwrap(), StatusFlags::empty());
    assert_eq!(slot.stats(false).unwrap().errors.watchdog_error, 1);
    assert_eq!(channel.stats(false).lifetime.watchdog_error, 1);
}

#[test]
fn test_bad_checksum_discards_feedback() {
    let (channel, chain, recorder) = setup(2);
    chain.set_corrupt_crc(1, true);
    chain.set_sensors(1, 0x7F);

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.new_errors.rx_crc_error, 1);
    assert_eq!(recorder.take(), vec![(1, Note::Status(StatusFlags::CRC_ERROR))]);
    assert_eq!(channel.slot(1).unwrap().sensors().unwrap(), 0);
}

#[test]
fn test_client_crc_self_test_is_suppressed() {
    let (channel, _chain, recorder) = setup(1);
    let slot = channel.slot(0).unwrap();

    slot.set_invert_client_crc(true).unwrap();
    for _ in 0..3 {
        assert!(channel.run_cycle().unwrap().new_errors.is_empty());
    }

    slot.set_invert_client_crc(false).unwrap();
    for _ in 0..4 {
        assert!(channel.run_cycle().unwrap().new_errors.is_empty());
    }
    assert!(recorder.take().is_empty());
}

#[test]
fn test_server_crc_self_test_is_suppressed() {
    let (channel, chain, recorder) = setup(2);
    let slot = channel.slot(1).unwrap();

    slot.set_invert_server_crc(true).unwrap();
    let report = channel.run_cycle().unwrap();
    assert!(report.responses[1].remote_crc_error);
    assert!(report.new_errors.is_empty());

    slot.set_invert_server_crc(false).unwrap();
    let report = channel.run_cycle().unwrap();
    assert!(!report.responses[1].remote_crc_error);
    assert!(report.new_errors.is_empty());
    // Channel never enabled, so satellites stay switched off
    assert!(!chain.last_tx_frame(1).unwrap().enable);
    assert!(recorder.take().is_empty());
}

#[test]
fn test_corrupted_responses_raise_crc_errors() {
    let (channel, chain, recorder) = setup(2);
    chain.set_faults(FaultInjectionConfig {
        enabled: true,
        crc_corruption_percent: 100.0,
        ..FaultInjectionConfig::default()
    });

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.new_errors.rx_crc_error, 2);
    assert_eq!(recorder.take().len(), 2);
}

#[test]
fn test_symbol_error_counts_once_per_cycle() {
    let (channel, chain, _recorder) = setup(3);
    chain.set_faults(FaultInjectionConfig {
        enabled: true,
        symbol_error_percent: 100.0,
        ..FaultInjectionConfig::default()
    });

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.cycle_error, Some(StatusFlags::SYMBOL_ERROR));
    assert_eq!(report.new_errors.rx_symbol_error, 1);
    assert!(report.responses.is_empty());
    assert_eq!(chain.pending_captures(), 0);

    for slot in channel.slots() {
        assert_eq!(slot.status().unwrap(), StatusFlags::SYMBOL_ERROR);
        assert_eq!(slot.stats(false).unwrap().errors.rx_symbol_error, 1);
    }
}

#[test]
fn test_dropped_capture_is_size_error() {
    let (channel, chain, _recorder) = setup(1);
    chain.set_faults(FaultInjectionConfig {
        enabled: true,
        drop_capture_percent: 100.0,
        ..FaultInjectionConfig::default()
    });

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.received_bits, 0);
    assert_eq!(report.cycle_error, Some(StatusFlags::SIZE_ERROR));
}

#[test]
fn test_invalid_actuator_index() {
    let (channel, _chain, _recorder) = setup(1);
    let slot = channel.slot(0).unwrap();
    assert!(matches!(
        slot.set_actuator(4, 1, ActuatorMode::Low),
        Err(ChannelError::InvalidActuator(4))
    ));
    assert!(matches!(slot.actuator(7), Err(ChannelError::InvalidActuator(7))));
}
