//! Session counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// GetRows calls issued.
    pub polls: u64,
    /// Rows received from the network.
    pub rows_received: u64,
    /// Rows applied to a table (network and save confirmations).
    pub rows_applied: u64,
    /// Rows dropped because that version was already applied.
    pub duplicates_dropped: u64,
    /// Rows dropped because no joined table has their type hash.
    pub unknown_table_rows: u64,
    /// GetRows calls that hit the local deadline.
    pub timeouts: u64,
    /// GetRows calls left running on a blocking worker after a timeout or abort.
    pub abandoned_polls: u64,
    /// GetRows calls that failed otherwise.
    pub poll_errors: u64,
    /// Forced full resyncs.
    pub resyncs: u64,
    /// SendRows batches confirmed by the server.
    pub saves_confirmed: u64,
    /// Saves that failed.
    pub saves_failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    polls: AtomicU64,
    rows_received: AtomicU64,
    rows_applied: AtomicU64,
    duplicates_dropped: AtomicU64,
    unknown_table_rows: AtomicU64,
    timeouts: AtomicU64,
    abandoned_polls: AtomicU64,
    poll_errors: AtomicU64,
    resyncs: AtomicU64,
    saves_confirmed: AtomicU64,
    saves_failed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn record_poll(&self) {
        bump(&self.polls, 1);
    }

    pub(crate) fn record_received(&self, rows: usize) {
        bump(&self.rows_received, rows as u64);
    }

    pub(crate) fn record_applied(&self, rows: usize) {
        bump(&self.rows_applied, rows as u64);
    }

    pub(crate) fn record_duplicates(&self, rows: usize) {
        bump(&self.duplicates_dropped, rows as u64);
    }

    pub(crate) fn record_unknown(&self, rows: usize) {
        bump(&self.unknown_table_rows, rows as u64);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts, 1);
    }

    pub(crate) fn record_abandoned(&self) {
        bump(&self.abandoned_polls, 1);
    }

    pub(crate) fn record_poll_error(&self) {
        bump(&self.poll_errors, 1);
    }

    pub(crate) fn record_resync(&self) {
        bump(&self.resyncs, 1);
    }

    pub(crate) fn record_save(&self, ok: bool) {
        if ok {
            bump(&self.saves_confirmed, 1);
        } else {
            bump(&self.saves_failed, 1);
        }
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            polls: load(&self.polls),
            rows_received: load(&self.rows_received),
            rows_applied: load(&self.rows_applied),
            duplicates_dropped: load(&self.duplicates_dropped),
            unknown_table_rows: load(&self.unknown_table_rows),
            timeouts: load(&self.timeouts),
            abandoned_polls: load(&self.abandoned_polls),
            poll_errors: load(&self.poll_errors),
            resyncs: load(&self.resyncs),
            saves_confirmed: load(&self.saves_confirmed),
            saves_failed: load(&self.saves_failed),
        }
    }
}
