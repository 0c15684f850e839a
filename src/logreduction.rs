//! Suppresses repeated identical error messages per pod.
//!
//! Runtime failures tend to repeat on every sync cycle; without a filter a
//! single broken pod can flood the log. [`LogReduction`] allows one identical
//! line per pod per window and lets everything else through.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Tracks the last error printed per pod so identical lines can be throttled.
pub struct LogReduction {
    identical_error_delay: Duration,
    last_printed: DashMap<String, (String, Instant)>,
}

impl LogReduction {
    pub fn new(identical_error_delay: Duration) -> Self {
        Self {
            identical_error_delay,
            last_printed: DashMap::new(),
        }
    }

    /// Returns true when `message` should be printed for `parent_id`: the id
    /// has no record, the message differs from the last one printed, or the
    /// last print is older than the window. A true return records the print.
    pub fn should_message_be_printed(&self, message: &str, parent_id: &str) -> bool {
        let should_print = match self.last_printed.get(parent_id) {
            Some(entry) => {
                let (last_message, printed_at) = entry.value();
                last_message != message || printed_at.elapsed() >= self.identical_error_delay
            }
            None => true,
        };
        if should_print {
            self.last_printed.insert(
                parent_id.to_string(),
                (message.to_string(), Instant::now()),
            );
        }
        should_print
    }

    /// Drops the record for `parent_id`, e.g. once its status call succeeds.
    pub fn clear_id(&self, parent_id: &str) {
        self.last_printed.remove(parent_id);
    }
}
