//! Single-flight dedup cache keyed by canonical input.
//!
//! The first submission for a key reserves an entry pointing at a freshly
//! allocated job id before the job exists. Every later submission for that
//! key joins the same job until the entry stops being live: the job failed
//! (entry invalidated) or its retention window ended (`expires_at` passed).

mod canonical;

pub use canonical::{CanonicalInput, DEFAULT_ALLOWED_HOSTS, InputPolicy};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

use crate::domain::{Job, JobStatus};

/// Where a cache entry's job stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub job_id: String,
    /// `None` while the job is still running.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn in_flight(job_id: String) -> Self {
        Self {
            job_id,
            expires_at: None,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// Outcome of [`DedupCache::reserve_or_join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: String,
    /// `true` if the caller must create and enqueue the job.
    pub is_new: bool,
}

/// Map from input key to the job covering it.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: DashMap<String, CacheEntry>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the live job for `key`, or reserve `key` for a new job id.
    pub fn reserve_or_join(&self, key: &str) -> Reservation {
        self.reserve_or_join_at(key, Utc::now())
    }

    pub fn reserve_or_join_at(&self, key: &str, now: DateTime<Utc>) -> Reservation {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live_at(now) {
                    trace!(key, job_id = %entry.get().job_id, "Dedup hit");
                    return Reservation {
                        job_id: entry.get().job_id.clone(),
                        is_new: false,
                    };
                }
                let job_id = new_job_id();
                debug!(key, stale = %entry.get().job_id, %job_id, "Replacing stale dedup entry");
                entry.insert(CacheEntry::in_flight(job_id.clone()));
                Reservation {
                    job_id,
                    is_new: true,
                }
            }
            Entry::Vacant(entry) => {
                let job_id = new_job_id();
                entry.insert(CacheEntry::in_flight(job_id.clone()));
                Reservation {
                    job_id,
                    is_new: true,
                }
            }
        }
    }

    /// Record that `job_id` completed; the entry stays live until `expires_at`.
    pub fn mark_completed(&self, key: &str, job_id: &str, expires_at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.job_id == job_id
        {
            entry.expires_at = Some(expires_at);
        }
    }

    /// Remove the entry for `key` if it still points at `job_id`.
    ///
    /// An entry already taken over by a newer job is left alone.
    pub fn invalidate(&self, key: &str, job_id: &str) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.job_id == job_id)
            .is_some();
        if removed {
            debug!(key, job_id, "Dedup entry invalidated");
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Drop entries whose retention ended; returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live_at(now));
        before - self.entries.len()
    }

    /// Repopulate from jobs that can still satisfy lookups.
    ///
    /// Active jobs become in-flight entries and completed jobs keep their
    /// `expires_at`. For duplicate keys the newest job wins.
    pub fn rebuild<'a, I>(&self, jobs: I) -> usize
    where
        I: IntoIterator<Item = &'a Job>,
    {
        self.entries.clear();
        for job in jobs {
            let entry = match job.status {
                status if status.is_active() => CacheEntry::in_flight(job.id.clone()),
                JobStatus::Completed => CacheEntry {
                    job_id: job.id.clone(),
                    expires_at: job.expires_at,
                },
                _ => continue,
            };
            self.entries.insert(job.input_key.clone(), entry);
        }
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
