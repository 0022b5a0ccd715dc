use satlink::*;

fn test_config(max_satellites: usize) -> ChannelConfig {
    ChannelConfig {
        name: "test".to_string(),
        max_satellites,
        scan_interval_ms: 5,
        discovery_settle_ms: 1,
        receive_timeout_ms: 2,
        ..ChannelConfig::default()
    }
}

#[test]
fn test_discovers_exact_chain_length() {
    let max = 4;
    for devices in 0..=max {
        let chain = SimulatedChain::new(devices);
        let channel = Channel::new(test_config(max), chain).unwrap();

        assert_eq!(channel.discover().unwrap(), devices, "chain of {}", devices);
        assert_eq!(channel.slot_count(), devices);
        assert_eq!(channel.slots().len(), devices);
        assert!(channel.slot(devices as u8).is_none());
    }
}

#[test]
fn test_excessive_devices_leaves_no_slots() {
    let chain = SimulatedChain::new(4);
    let channel = Channel::new(test_config(3), chain).unwrap();

    let err = channel.discover().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Discovery(DiscoveryError::ExcessiveDevices { max: 3 })
    ));
    assert_eq!(channel.slot_count(), 0);
    assert!(channel.slot(0).is_none());
}

#[test]
fn test_probe_reaches_guard_position() {
    let chain = SimulatedChain::new(0);
    let channel = Channel::new(test_config(2), chain.clone()).unwrap();
    assert_eq!(channel.discover().unwrap(), 0);

    // Probe covered both satellite positions plus the guard; an empty chain
    // has nothing to confirm, so nothing else went out
    assert!(chain.last_tx_frame(2).is_some());
    assert!(chain.last_tx_frame(3).is_none());
    assert_eq!(chain.stats().transmissions, 1);
}

#[test]
fn test_discovery_clears_server_inversion() {
    let chain = SimulatedChain::new(2);
    let channel = Channel::new(test_config(4), chain.clone()).unwrap();
    channel.discover().unwrap();

    let report = channel.run_cycle().unwrap();
    assert_eq!(report.positions, 2);
    assert!(report.new_errors.is_empty());
    assert!(report.responses.iter().all(|frame| !frame.remote_crc_error));

    let sent = chain.last_tx_frame(0).unwrap();
    assert!(sent.start_mark);
    assert!(!chain.last_tx_frame(1).unwrap().start_mark);
}

#[test]
fn test_link_error_during_probe() {
    let chain = SimulatedChain::new(2);
    chain.set_faults(FaultInjectionConfig {
        enabled: true,
        truncate_to_frames: Some(1),
        ..FaultInjectionConfig::default()
    });
    let channel = Channel::new(test_config(4), chain).unwrap();

    let err = channel.discover().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Discovery(DiscoveryError::Link(flags)) if flags == StatusFlags::SIZE_ERROR
    ));
    assert_eq!(channel.slot_count(), 0);
}

#[test]
fn test_rediscovery_replaces_slots() {
    let chain = SimulatedChain::new(3);
    let channel = Channel::new(test_config(4), chain.clone()).unwrap();
    assert_eq!(channel.discover().unwrap(), 3);

    let stale = channel.slot(2).unwrap();
    chain.set_device_count(1);
    assert_eq!(channel.discover().unwrap(), 1);

    assert!(matches!(stale.status(), Err(ChannelError::NoSuchSlot(2))));
    assert!(matches!(
        stale.set_actuator(0, 1, ActuatorMode::High),
        Err(ChannelError::NoSuchSlot(2))
    ));
}

#[test]
fn test_discovery_errors_not_reported_to_counters() {
    let chain = SimulatedChain::new(2);
    let channel = Channel::new(test_config(4), chain).unwrap();
    channel.discover().unwrap();

    let stats = channel.stats(false);
    assert_eq!(stats.cycles, 2);
    assert!(stats.lifetime.is_empty());
    assert!(stats.slots.iter().all(|slot| slot.errors.is_empty()));
}
