//! Chain enumeration.
//!
//! Discovery sends one probe cycle over every position up to and including the
//! guard position, with every checksum deliberately inverted. A satellite that
//! receives a broken frame for its own position answers with the remote-CRC
//! error bit set. An unpopulated position just hands the master's own frame
//! back, and the master never sets that bit. The populated chain is therefore
//! the run of leading positions that report a remote-CRC error.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::channel::{PositionStatus, RxPosition, Shared, TxPosition};
use crate::scan::CycleReport;
use crate::slot::StatusFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The guard position answered. Either the chain is longer than the
    /// channel supports or the feedback line is stuck.
    #[error("more than {max} satellites on the chain")]
    ExcessiveDevices { max: usize },
    #[error("link error during discovery ({0})")]
    Link(StatusFlags),
    #[error("discovery requires the scan loop to be stopped")]
    InvalidState,
}

/// Count the populated positions in a probe response.
fn count_responders(probe: &CycleReport, max_satellites: usize) -> Result<usize, DiscoveryError> {
    if let Some(flags) = probe.cycle_error {
        return Err(DiscoveryError::Link(flags));
    }

    let guard_answered = probe
        .responses
        .get(max_satellites)
        .is_some_and(|frame| frame.remote_crc_error);
    if guard_answered {
        return Err(DiscoveryError::ExcessiveDevices { max: max_satellites });
    }

    Ok(probe
        .responses
        .iter()
        .take(max_satellites)
        .take_while(|frame| frame.remote_crc_error)
        .count())
}

impl Shared {
    /// Tear down all slots and enumerate the chain from scratch.
    ///
    /// Returns the number of satellites found. On failure no slots exist.
    pub(crate) fn discover(&self) -> Result<usize, DiscoveryError> {
        let max = self.config.max_satellites;
        info!(channel = %self.config.name, max, "starting discovery");

        self.teardown_slots();
        self.reset_link(self.config.capacity(), true);

        let probe = self.scan_cycle();
        self.settle();

        let found = match count_responders(&probe, max) {
            Ok(found) => found,
            Err(e) => {
                warn!(channel = %self.config.name, error = %e, "discovery failed");
                self.reset_link(0, false);
                self.clear_status_dirty();
                return Err(e);
            }
        };

        self.reset_link(found, false);
        self.populate_slots(found);
        self.refresh_enable_bits();

        // One clean cycle so every satellite sees a valid frame before errors
        // start counting against it
        self.scan_cycle();
        self.settle();
        self.clear_status_dirty();

        info!(channel = %self.config.name, satellites = found, "discovery complete");
        Ok(found)
    }

    /// Reset every position and scan `active` of them from the next cycle on.
    ///
    /// Status is left dirty so nothing raised before discovery finishes gets
    /// reported.
    fn reset_link(&self, active: usize, invert_server_crc: bool) {
        {
            let mut tx = self.lock_tx();
            tx.active = active;
            for position in tx.positions.iter_mut() {
                *position = TxPosition {
                    invert_server_crc,
                    dirty: true,
                    ..TxPosition::default()
                };
            }
        }
        {
            let mut rx = self.lock_rx();
            rx.positions.fill(RxPosition::default());
        }
        let mut status = self.lock_status();
        status.positions.fill(PositionStatus {
            dirty: true,
            ..PositionStatus::default()
        });
    }

    fn clear_status_dirty(&self) {
        let mut status = self.lock_status();
        for position in status.positions.iter_mut() {
            position.dirty = false;
            position.flags = StatusFlags::empty();
        }
    }

    fn settle(&self) {
        if self.config.discovery_settle_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.discovery_settle_ms));
        }
    }
}
