//! Per-client concurrent job quota.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

/// Active-job counters keyed by client identity.
///
/// Check-and-increment happens under the map's per-key entry lock, so two
/// concurrent admissions for the same client cannot both take the last slot.
#[derive(Debug)]
pub struct QuotaLedger {
    max_active: u32,
    active: DashMap<String, u32>,
}

impl QuotaLedger {
    pub fn new(max_active: u32) -> Self {
        Self {
            max_active,
            active: DashMap::new(),
        }
    }

    pub fn max_active(&self) -> u32 {
        self.max_active
    }

    /// Take one slot for `client`, or `None` if the client is at its limit.
    ///
    /// The slot is returned when the reservation is dropped unless it was
    /// [committed](QuotaReservation::commit).
    pub fn try_reserve(self: &Arc<Self>, client: &str) -> Option<QuotaReservation> {
        let mut count = self.active.entry(client.to_string()).or_insert(0);
        if *count >= self.max_active {
            return None;
        }
        *count += 1;
        debug!(client, active = *count, "Quota slot reserved");
        drop(count);

        Some(QuotaReservation {
            ledger: Arc::clone(self),
            client: client.to_string(),
            armed: true,
        })
    }

    /// Return one slot for `client`.
    pub fn release(&self, client: &str) {
        match self.active.entry(client.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                *count = count.saturating_sub(1);
                debug!(client, active = *count, "Quota slot released");
                if *count == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => {
                warn!(client, "Quota release for client without active jobs");
            }
        }
    }

    /// Slots currently held by `client`.
    pub fn active(&self, client: &str) -> u32 {
        self.active.get(client).map(|c| *c).unwrap_or(0)
    }

    /// Replace all counters, e.g. with counts recovered from the job store.
    pub fn restore<I>(&self, counts: I)
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        self.active.clear();
        for (client, count) in counts {
            if count > 0 {
                self.active.insert(client, count.min(u32::MAX as i64) as u32);
            }
        }
    }

    pub fn total_active(&self) -> u64 {
        self.active.iter().map(|c| u64::from(*c.value())).sum()
    }
}

/// A quota slot held on behalf of a not-yet-created job.
#[derive(Debug)]
#[must_use = "dropping a reservation releases the slot"]
pub struct QuotaReservation {
    ledger: Arc<QuotaLedger>,
    client: String,
    armed: bool,
}

impl QuotaReservation {
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Hand the slot over to a created job; it is released when that job
    /// reaches a terminal state instead of when this value is dropped.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.armed {
            self.ledger.release(&self.client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_up_to_limit() {
        let ledger = Arc::new(QuotaLedger::new(2));
        let a = ledger.try_reserve("c").unwrap();
        let b = ledger.try_reserve("c").unwrap();
        assert!(ledger.try_reserve("c").is_none());
        assert!(ledger.try_reserve("other").is_some());
        a.commit();
        b.commit();
        assert_eq!(ledger.active("c"), 2);
    }

    #[test]
    fn test_drop_releases_uncommitted() {
        let ledger = Arc::new(QuotaLedger::new(1));
        {
            let _reservation = ledger.try_reserve("c").unwrap();
            assert_eq!(ledger.active("c"), 1);
        }
        assert_eq!(ledger.active("c"), 0);
        assert!(ledger.try_reserve("c").is_some());
    }

    #[test]
    fn test_release_after_commit() {
        let ledger = Arc::new(QuotaLedger::new(1));
        ledger.try_reserve("c").unwrap().commit();
        assert!(ledger.try_reserve("c").is_none());
        ledger.release("c");
        assert_eq!(ledger.active("c"), 0);
        ledger.release("c");
        assert_eq!(ledger.active("c"), 0);
    }

    #[test]
    fn test_restore() {
        let ledger = QuotaLedger::new(3);
        ledger.restore(vec![("a".to_string(), 2), ("b".to_string(), 0)]);
        assert_eq!(ledger.active("a"), 2);
        assert_eq!(ledger.active("b"), 0);
        assert_eq!(ledger.total_active(), 2);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let ledger = Arc::new(QuotaLedger::new(2));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.try_reserve("c").map(QuotaReservation::commit))
            })
            .collect();
        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(granted, 2);
        assert_eq!(ledger.active("c"), 2);
    }
}
