use crate::types::Snapshot;

/// Latest snapshot plus the bookkeeping needed to expire it.
///
/// Time is passed in as monotonic milliseconds so callers decide the clock.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data: Snapshot,
    last_update_ms: Option<u64>,
    interval_ms: u64,
}

impl SnapshotStore {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            data: Snapshot::new(),
            last_update_ms: None,
            interval_ms,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn set_interval_ms(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    pub fn last_update_ms(&self) -> Option<u64> {
        self.last_update_ms
    }

    /// Replaces the snapshot wholesale and records the update time.
    pub fn set_updated_data(&mut self, data: Snapshot, now_ms: u64) {
        self.data = data;
        self.last_update_ms = Some(now_ms);
    }

    /// Clears the snapshot if it is older than the interval.
    ///
    /// Returns `true` when data was dropped. An empty store never expires.
    pub fn expire(&mut self, now_ms: u64) -> bool {
        let Some(last_update_ms) = self.last_update_ms else {
            return false;
        };
        if self.data.is_empty() {
            return false;
        }

        if now_ms.saturating_sub(last_update_ms) >= self.interval_ms {
            self.data = Snapshot::new();
            return true;
        }
        false
    }

    /// The snapshot as of `now_ms`, expiring it first when stale.
    pub fn data(&mut self, now_ms: u64) -> &Snapshot {
        self.expire(now_ms);
        &self.data
    }

    /// The stored snapshot without an expiry check.
    pub fn peek(&self) -> &Snapshot {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        [("V1", 230.1), ("A1", 1.5), ("W1", 345.0)].into_iter().collect()
    }

    #[test]
    fn fresh_data_is_returned_unchanged() {
        let mut store = SnapshotStore::new(60_000);
        store.set_updated_data(sample(), 1_000);

        assert_eq!(store.data(60_999), &sample());
        assert_eq!(store.last_update_ms(), Some(1_000));
    }

    #[test]
    fn data_expires_once_interval_elapses() {
        let mut store = SnapshotStore::new(60_000);
        store.set_updated_data(sample(), 1_000);

        assert!(store.data(61_000).is_empty());
        assert!(!store.expire(120_000));
    }

    #[test]
    fn push_after_poll_window_resets_the_clock() {
        let mut store = SnapshotStore::new(5_000);
        store.set_updated_data(sample(), 0);
        store.set_updated_data(sample(), 4_000);

        assert!(!store.expire(6_000));
        assert_eq!(store.data(8_999), &sample());
        assert!(store.expire(9_000));
    }

    #[test]
    fn empty_store_never_expires() {
        let mut store = SnapshotStore::new(5_000);
        assert!(!store.expire(1_000_000));

        store.set_updated_data(Snapshot::new(), 0);
        assert!(!store.expire(1_000_000));
    }

    #[test]
    fn shorter_interval_applies_to_existing_data() {
        let mut store = SnapshotStore::new(60_000);
        store.set_updated_data(sample(), 0);
        store.set_interval_ms(5_000);

        assert_eq!(store.interval_ms(), 5_000);
        assert!(store.expire(5_000));
    }
}
