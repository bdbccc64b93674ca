//! Tracking of already-applied row versions.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lower bound of the adaptive transfer budget.
pub const TRANSFER_BUDGET_FLOOR: u32 = 256 * 1024;

/// Upper bound of the adaptive transfer budget.
pub const TRANSFER_BUDGET_CEILING: u32 = 2 * 1024 * 1024;

/// Number of most recent entries kept regardless of the watermark.
pub const RETENTION_FLOOR: usize = 10;

/// Round trip at which the budget exactly doubles.
pub const REFERENCE_ROUND_TRIP: Duration = Duration::from_secs(1);

/// Remembers which `(record id, version)` pairs were applied.
///
/// The deduper is owned by a session and guarded by the same lock as the
/// session's row watermark.
#[derive(Debug)]
pub struct Deduper {
    known: HashMap<Uuid, u64>,
    history: Option<VecDeque<(u64, Uuid)>>,
    transfer_budget_bytes: u32,
    last_transfer: Option<Instant>,
}

impl Deduper {
    /// Creates an empty deduper, optionally keeping an ordered history.
    pub fn new(history_tracking: bool) -> Self {
        Self {
            known: HashMap::new(),
            history: history_tracking.then(VecDeque::new),
            transfer_budget_bytes: TRANSFER_BUDGET_FLOOR,
            last_transfer: None,
        }
    }

    /// Returns true if a version at least as new was already accepted.
    pub fn is_known(&self, id: Uuid, version: u64) -> bool {
        self.known.get(&id).is_some_and(|&known| known >= version)
    }

    /// Registers an accepted version.
    pub fn record(&mut self, id: Uuid, version: u64) {
        let entry = self.known.entry(id).or_insert(version);
        if *entry < version {
            *entry = version;
        }
        if let Some(history) = &mut self.history {
            history.push_back((version, id));
        }
    }

    /// Drops entries older than the watermark, keeping the most recent
    /// [`RETENTION_FLOOR`] entries regardless of age.
    ///
    /// A zero watermark signals a forced resync: all state is cleared and the
    /// transfer budget returns to its floor.
    pub fn apply_retention_window(&mut self, last_known_row_version: u64) {
        if last_known_row_version == 0 {
            self.reset();
            return;
        }

        match &mut self.history {
            Some(history) => {
                let keep_from = history.len().saturating_sub(RETENTION_FLOOR);
                let mut kept = VecDeque::with_capacity(history.len());
                for (index, (version, id)) in history.drain(..).enumerate() {
                    if version >= last_known_row_version || index >= keep_from {
                        kept.push_back((version, id));
                    } else if self.known.get(&id) == Some(&version) {
                        self.known.remove(&id);
                    }
                }
                *history = kept;
            }
            None => {
                if self.known.len() <= RETENTION_FLOOR {
                    return;
                }
                let mut versions: Vec<u64> = self.known.values().copied().collect();
                versions.sort_unstable_by(|a, b| b.cmp(a));
                let floor = versions[RETENTION_FLOOR - 1];
                self.known
                    .retain(|_, version| *version >= last_known_row_version || *version >= floor);
            }
        }
    }

    /// Adapts the transfer budget to the time elapsed since the previous
    /// transfer and returns that elapsed time.
    pub fn on_transfer_start(&mut self) -> Option<Duration> {
        self.on_transfer_start_at(Instant::now())
    }

    /// [`Deduper::on_transfer_start`] with an explicit clock reading.
    pub fn on_transfer_start_at(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = self
            .last_transfer
            .replace(now)
            .map(|previous| now.saturating_duration_since(previous))?;

        // Target twice the observed throughput over one reference round trip.
        let seconds = elapsed.as_secs_f64().max(0.001);
        let proposed = f64::from(self.transfer_budget_bytes)
            * 2.0
            * (REFERENCE_ROUND_TRIP.as_secs_f64() / seconds);
        self.transfer_budget_bytes = proposed.clamp(
            f64::from(TRANSFER_BUDGET_FLOOR),
            f64::from(TRANSFER_BUDGET_CEILING),
        ) as u32;

        Some(elapsed)
    }

    /// Current transfer budget in bytes.
    pub fn transfer_budget_bytes(&self) -> u32 {
        self.transfer_budget_bytes
    }

    /// Number of record ids with a known version.
    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// Number of history entries (zero when history is disabled).
    pub fn history_len(&self) -> usize {
        self.history.as_ref().map_or(0, VecDeque::len)
    }

    /// Returns true when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.history_len() == 0
    }

    /// Clears all state and resets the transfer budget.
    pub fn reset(&mut self) {
        self.known.clear();
        if let Some(history) = &mut self.history {
            history.clear();
        }
        self.transfer_budget_bytes = TRANSFER_BUDGET_FLOOR;
        self.last_transfer = None;
    }
}

impl Default for Deduper {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions() {
        let mut deduper = Deduper::new(true);
        let id = Uuid::new_v4();

        assert!(!deduper.is_known(id, 1));
        deduper.record(id, 5);
        assert!(deduper.is_known(id, 5));
        assert!(deduper.is_known(id, 3));
        assert!(!deduper.is_known(id, 6));

        // An older version never lowers the known one.
        deduper.record(id, 2);
        assert!(deduper.is_known(id, 5));
    }

    #[test]
    fn zero_watermark_resets_everything() {
        let mut deduper = Deduper::new(true);
        let start = Instant::now();
        deduper.on_transfer_start_at(start);
        deduper.on_transfer_start_at(start + Duration::from_millis(100));
        assert!(deduper.transfer_budget_bytes() > TRANSFER_BUDGET_FLOOR);

        deduper.record(Uuid::new_v4(), 10);
        deduper.apply_retention_window(0);

        assert!(deduper.is_empty());
        assert_eq!(deduper.known_len(), 0);
        assert_eq!(deduper.history_len(), 0);
        assert_eq!(deduper.transfer_budget_bytes(), TRANSFER_BUDGET_FLOOR);
    }

    #[test]
    fn retention_keeps_recent_entries() {
        let mut deduper = Deduper::new(true);
        let ids: Vec<Uuid> = (0..30).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            deduper.record(*id, i as u64 + 1);
        }

        // Everything is older than the watermark, but the last ten survive.
        deduper.apply_retention_window(1_000);
        assert_eq!(deduper.history_len(), RETENTION_FLOOR);
        assert_eq!(deduper.known_len(), RETENTION_FLOOR);
        assert!(deduper.is_known(ids[29], 30));
        assert!(deduper.is_known(ids[20], 21));
        assert!(!deduper.is_known(ids[19], 20));
    }

    #[test]
    fn retention_keeps_entries_at_or_above_watermark() {
        let mut deduper = Deduper::new(true);
        let ids: Vec<Uuid> = (0..30).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            deduper.record(*id, i as u64 + 1);
        }

        deduper.apply_retention_window(5);
        assert_eq!(deduper.known_len(), 26);
        assert!(deduper.is_known(ids[4], 5));
        assert!(!deduper.is_known(ids[3], 4));
    }

    #[test]
    fn retention_does_not_forget_newer_version_of_same_id() {
        let mut deduper = Deduper::new(true);
        let id = Uuid::new_v4();
        deduper.record(id, 1);
        for v in 2..20 {
            deduper.record(Uuid::new_v4(), v);
        }
        deduper.record(id, 50);

        deduper.apply_retention_window(40);
        assert!(deduper.is_known(id, 50));
    }

    #[test]
    fn retention_without_history() {
        let mut deduper = Deduper::new(false);
        let ids: Vec<Uuid> = (0..25).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            deduper.record(*id, i as u64 + 1);
        }
        assert_eq!(deduper.history_len(), 0);

        deduper.apply_retention_window(100);
        assert_eq!(deduper.known_len(), RETENTION_FLOOR);
        assert!(deduper.is_known(ids[24], 25));
        assert!(!deduper.is_known(ids[0], 1));
    }

    #[test]
    fn transfer_budget_adapts_to_round_trip() {
        let mut deduper = Deduper::new(true);
        let start = Instant::now();
        assert_eq!(deduper.on_transfer_start_at(start), None);
        assert_eq!(deduper.transfer_budget_bytes(), TRANSFER_BUDGET_FLOOR);

        // One reference round trip doubles the budget.
        let elapsed = deduper
            .on_transfer_start_at(start + REFERENCE_ROUND_TRIP)
            .unwrap();
        assert_eq!(elapsed, REFERENCE_ROUND_TRIP);
        assert_eq!(deduper.transfer_budget_bytes(), 2 * TRANSFER_BUDGET_FLOOR);

        // Fast round trips saturate at the ceiling.
        let t = start + REFERENCE_ROUND_TRIP + Duration::from_millis(10);
        deduper.on_transfer_start_at(t);
        assert_eq!(deduper.transfer_budget_bytes(), TRANSFER_BUDGET_CEILING);

        // Slow round trips fall back to the floor.
        deduper.on_transfer_start_at(t + Duration::from_secs(60));
        assert_eq!(deduper.transfer_budget_bytes(), TRANSFER_BUDGET_FLOOR);
    }
}
