//! Exponential backoff store for container restarts.
//!
//! Entries are keyed by the stable `podUID_containerName_hash` string so that
//! backoff history carries across sandbox recreations but resets when a
//! container's spec legitimately changes. The store is shared across pod sync
//! workers and must stay safe for concurrent use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::spec::{ContainerSpec, PodTask, hash_container};

#[derive(Debug, Clone)]
struct BackoffEntry {
    backoff: Duration,
    last_update: DateTime<Utc>,
}

/// Per-key exponential backoff: doubles on every advance up to a cap, and
/// forgets a key once it has been idle long enough.
pub struct Backoff {
    base: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Current backoff for `key`, zero when the key is unknown.
    pub fn get(&self, key: &str) -> Duration {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(key).map(|e| e.backoff).unwrap_or_default()
    }

    /// True when `key` is still inside its backoff window measured from
    /// `event_time` (the reference event, e.g. the container's last exit).
    pub fn is_in_backoff_since(&self, key: &str, event_time: DateTime<Utc>) -> bool {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = entries.get(key) else {
            return false;
        };
        if has_expired(event_time, entry.last_update, self.max) {
            return false;
        }
        let since_event = Utc::now().signed_duration_since(event_time);
        since_event
            .to_std()
            .map(|elapsed| elapsed < entry.backoff)
            .unwrap_or(true)
    }

    /// Advances the backoff slot for `key`: resets to the base duration when
    /// the key is new or has gone stale, doubles (capped) otherwise.
    pub fn next(&self, key: &str, event_time: DateTime<Utc>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        match entries.get_mut(key) {
            Some(entry) if !has_expired(event_time, entry.last_update, self.max) => {
                entry.backoff = (entry.backoff * 2).min(self.max);
                entry.last_update = now;
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    BackoffEntry {
                        backoff: self.base,
                        last_update: now,
                    },
                );
            }
        }
    }

    /// Forgets the backoff history for `key`.
    pub fn delete(&self, key: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(key);
    }
}

// An entry is stale once the reference event is far enough past the last
// update that the history no longer says anything about the present.
fn has_expired(event_time: DateTime<Utc>, last_update: DateTime<Utc>, max: Duration) -> bool {
    event_time
        .signed_duration_since(last_update)
        .to_std()
        .map(|gap| gap > max * 2)
        .unwrap_or(false)
}

/// Stable backoff key for a container: `podUID_containerName_hash`. The hash
/// component drops restart history across legitimate spec changes.
pub fn stable_key(pod: &PodTask, container: &ContainerSpec) -> String {
    format!(
        "{}_{}_{}",
        pod.metadata.uid,
        container.name,
        hash_container(container)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ObjectMeta, PodSpec};

    fn make_backoff() -> Backoff {
        Backoff::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    #[test]
    fn unknown_key_is_not_in_backoff() {
        let backoff = make_backoff();
        assert!(!backoff.is_in_backoff_since("k", Utc::now()));
        assert_eq!(backoff.get("k"), Duration::ZERO);
    }

    #[test]
    fn recent_event_is_inside_the_window_after_advance() {
        let backoff = make_backoff();
        let event_time = Utc::now();
        backoff.next("k", event_time);
        assert_eq!(backoff.get("k"), Duration::from_secs(10));
        assert!(backoff.is_in_backoff_since("k", event_time));
    }

    #[test]
    fn old_event_is_outside_the_window() {
        let backoff = make_backoff();
        let event_time = Utc::now() - chrono::Duration::seconds(60);
        backoff.next("k", event_time);
        assert!(!backoff.is_in_backoff_since("k", event_time));
    }

    #[test]
    fn advance_doubles_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(25));
        let event_time = Utc::now();
        backoff.next("k", event_time);
        backoff.next("k", event_time);
        assert_eq!(backoff.get("k"), Duration::from_secs(20));
        backoff.next("k", event_time);
        assert_eq!(backoff.get("k"), Duration::from_secs(25));
        backoff.next("k", event_time);
        assert_eq!(backoff.get("k"), Duration::from_secs(25));
    }

    #[test]
    fn stale_entry_resets_to_base() {
        let backoff = make_backoff();
        backoff.next("k", Utc::now());
        backoff.next("k", Utc::now());
        assert_eq!(backoff.get("k"), Duration::from_secs(20));

        // a reference event far in the future of the last update means the
        // stored history has gone stale
        let stale_event = Utc::now() + chrono::Duration::seconds(700);
        backoff.next("k", stale_event);
        assert_eq!(backoff.get("k"), Duration::from_secs(10));
    }

    #[test]
    fn delete_forgets_history() {
        let backoff = make_backoff();
        backoff.next("k", Utc::now());
        backoff.delete("k");
        assert_eq!(backoff.get("k"), Duration::ZERO);
    }

    #[test]
    fn stable_key_includes_uid_name_and_hash() {
        let container = ContainerSpec {
            name: "server".to_string(),
            image: "nginx".to_string(),
            command: vec![],
            args: vec![],
            working_dir: None,
            env: vec![],
            ports: vec![],
            resources: None,
            liveness_probe: None,
            lifecycle: None,
            security_context: None,
            sidecar: false,
        };
        let pod = PodTask {
            api_version: String::new(),
            kind: String::new(),
            metadata: ObjectMeta {
                uid: uuid::Uuid::new_v4(),
                name: "web".to_string(),
                ..Default::default()
            },
            spec: PodSpec::default(),
        };

        let key = stable_key(&pod, &container);
        assert!(key.starts_with(&pod.metadata.uid.to_string()));
        assert!(key.contains("_server_"));
        assert!(key.ends_with(&hash_container(&container)));

        // a spec change produces a different key, dropping restart history
        let mut changed = container.clone();
        changed.image = "nginx:next".to_string();
        assert_ne!(key, stable_key(&pod, &changed));
    }
}
