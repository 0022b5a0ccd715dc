//! Link performance counters.

use serde::{Deserialize, Serialize};

use crate::slot::StatusFlags;

/// Error categories tracked per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TxUnderrun,
    RxOverrun,
    ScanTimingViolation,
    RxSizeError,
    RxSymbolError,
    WatchdogError,
    RxCrcError,
    RemoteCrcError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::TxUnderrun,
        ErrorKind::RxOverrun,
        ErrorKind::ScanTimingViolation,
        ErrorKind::RxSizeError,
        ErrorKind::RxSymbolError,
        ErrorKind::WatchdogError,
        ErrorKind::RxCrcError,
        ErrorKind::RemoteCrcError,
    ];

    /// Kinds a slot status bitmap can raise
    pub fn from_status(flags: StatusFlags) -> impl Iterator<Item = ErrorKind> {
        [
            (StatusFlags::SYMBOL_ERROR, ErrorKind::RxSymbolError),
            (StatusFlags::SIZE_ERROR, ErrorKind::RxSizeError),
            (StatusFlags::CRC_ERROR, ErrorKind::RxCrcError),
            (StatusFlags::REMOTE_CRC_ERROR, ErrorKind::RemoteCrcError),
            (StatusFlags::WATCHDOG_ERROR, ErrorKind::WatchdogError),
        ]
        .into_iter()
        .filter(move |(flag, _)| flags.contains(*flag))
        .map(|(_, kind)| kind)
    }
}

/// One counter per error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub tx_underrun: u32,
    pub rx_overrun: u32,
    pub scan_timing_violation: u32,
    pub rx_size_error: u32,
    pub rx_symbol_error: u32,
    pub watchdog_error: u32,
    pub rx_crc_error: u32,
    pub remote_crc_error: u32,
}

impl ErrorCounts {
    fn counter_mut(&mut self, kind: ErrorKind) -> &mut u32 {
        match kind {
            ErrorKind::TxUnderrun => &mut self.tx_underrun,
            ErrorKind::RxOverrun => &mut self.rx_overrun,
            ErrorKind::ScanTimingViolation => &mut self.scan_timing_violation,
            ErrorKind::RxSizeError => &mut self.rx_size_error,
            ErrorKind::RxSymbolError => &mut self.rx_symbol_error,
            ErrorKind::WatchdogError => &mut self.watchdog_error,
            ErrorKind::RxCrcError => &mut self.rx_crc_error,
            ErrorKind::RemoteCrcError => &mut self.remote_crc_error,
        }
    }

    pub fn get(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::TxUnderrun => self.tx_underrun,
            ErrorKind::RxOverrun => self.rx_overrun,
            ErrorKind::ScanTimingViolation => self.scan_timing_violation,
            ErrorKind::RxSizeError => self.rx_size_error,
            ErrorKind::RxSymbolError => self.rx_symbol_error,
            ErrorKind::WatchdogError => self.watchdog_error,
            ErrorKind::RxCrcError => self.rx_crc_error,
            ErrorKind::RemoteCrcError => self.remote_crc_error,
        }
    }

    pub fn add(&mut self, kind: ErrorKind, n: u32) {
        let counter = self.counter_mut(kind);
        *counter = counter.saturating_add(n);
    }

    pub fn merge(&mut self, other: &ErrorCounts) {
        for kind in ErrorKind::ALL {
            self.add(kind, other.get(kind));
        }
    }

    /// Sum used by the health hysteresis. Transmit underruns are a local
    /// resource problem, not a link quality signal, and are left out.
    pub fn link_error_sum(&self) -> u32 {
        ErrorKind::ALL
            .iter()
            .filter(|kind| **kind != ErrorKind::TxUnderrun)
            .fold(0u32, |sum, kind| sum.saturating_add(self.get(*kind)))
    }

    pub fn is_empty(&self) -> bool {
        ErrorKind::ALL.iter().all(|kind| self.get(*kind) == 0)
    }
}

/// Channel-wide counters: lifetime totals plus the current one-second window
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceCounters {
    lifetime: ErrorCounts,
    this_second: ErrorCounts,
    cycles: u64,
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ErrorKind) {
        self.lifetime.add(kind, 1);
        self.this_second.add(kind, 1);
    }

    pub fn record_all(&mut self, counts: &ErrorCounts) {
        self.lifetime.merge(counts);
        self.this_second.merge(counts);
    }

    pub fn record_cycle(&mut self) {
        self.cycles = self.cycles.wrapping_add(1);
    }

    pub fn lifetime(&self) -> &ErrorCounts {
        &self.lifetime
    }

    pub fn this_second(&self) -> &ErrorCounts {
        &self.this_second
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Called by the hysteresis once per one-second window, never elsewhere
    pub(crate) fn reset_window(&mut self) {
        self.this_second = ErrorCounts::default();
    }

    /// Clear lifetime totals. The window counters belong to the hysteresis.
    pub fn reset_lifetime(&mut self) {
        self.lifetime = ErrorCounts::default();
        self.cycles = 0;
    }
}

/// Snapshot handed out by [`crate::Channel::stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub cycles: u64,
    pub lifetime: ErrorCounts,
    pub this_second: ErrorCounts,
    pub slots: Vec<SlotStats>,
}

/// Per-slot error totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlotStats {
    pub address: u8,
    pub errors: ErrorCounts,
}
