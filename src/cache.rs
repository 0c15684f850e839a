//! Single-slot, TTL-bounded cache for the runtime's version report.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cri::api::VersionResponse;

struct Entry {
    machine_id: String,
    version: VersionResponse,
    fetched_at: Instant,
}

/// Memoizes the runtime's reported version, keyed by machine identity.
///
/// The slot lock is held across the refresh call, so concurrent misses
/// coalesce into a single upstream request: waiters observe the freshly
/// stored entry once the first caller returns.
pub struct VersionCache {
    ttl: Duration,
    slot: Mutex<Option<Entry>>,
}

impl VersionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached version for `machine_id`, refreshing through
    /// `refresh` on a miss, a key change, or expiry.
    pub fn get<F>(&self, machine_id: &str, refresh: F) -> anyhow::Result<VersionResponse>
    where
        F: FnOnce() -> anyhow::Result<VersionResponse>,
    {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = slot.as_ref()
            && entry.machine_id == machine_id
            && entry.fetched_at.elapsed() < self.ttl
        {
            return Ok(entry.version.clone());
        }

        let version = refresh()?;
        *slot = Some(Entry {
            machine_id: machine_id.to_string(),
            version: version.clone(),
            fetched_at: Instant::now(),
        });
        Ok(version)
    }
}
