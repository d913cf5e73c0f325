//! Sliding-window ban list for bogus GET traffic.
//!
//! Port scanners and confused browsers probe the agent's port; every
//! unknown GET from a source address is tracked, and once a source
//! accumulates the threshold within the window it is refused with 429
//! until the window rolls over with no further bad requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

struct BanEntry {
    count: u32,
    stamp: Instant,
}

/// Source address to bad-request count, with expiry.
pub struct BanList {
    count_to_ban: u32,
    window: Duration,
    entries: Mutex<HashMap<String, BanEntry>>,
}

impl BanList {
    #[must_use]
    pub fn new(count_to_ban: u32, window: Duration) -> Self {
        Self {
            count_to_ban,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests from this source should be refused.
    ///
    /// An expired entry unbans the source and stops tracking it.
    pub fn is_banned(&self, source: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(source) else {
            return false;
        };

        if entry.stamp.elapsed() > self.window {
            debug!(source, "ban expired");
            entries.remove(source);
            return false;
        }

        // log the start of a ban period once, and restart the window from
        // the moment the ban takes effect
        if entry.count == self.count_to_ban {
            debug!(source, "banning source");
            entry.count += 1;
            entry.stamp = Instant::now();
        }
        entry.count >= self.count_to_ban
    }

    /// Record one unknown-endpoint request from a source.
    pub fn track(&self, source: &str) {
        let mut entries = self.lock();
        match entries.get_mut(source) {
            Some(entry) => {
                entry.count += 1;
                entry.stamp = Instant::now();
            }
            None => {
                debug!(source, "tracking source");
                entries.insert(
                    source.to_owned(),
                    BanEntry {
                        count: 1,
                        stamp: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop entries whose window has rolled over.
    pub fn cleanup(&self) {
        self.lock()
            .retain(|_, entry| entry.stamp.elapsed() <= self.window);
    }

    /// Banned and tracked sources, for the status endpoint.
    #[must_use]
    pub fn summary(&self) -> Value {
        self.cleanup();
        let entries = self.lock();
        let mut banned = Vec::new();
        let mut tracked = Vec::new();
        for (source, entry) in entries.iter() {
            if entry.count >= self.count_to_ban {
                banned.push(source.clone());
            } else {
                tracked.push(source.clone());
            }
        }
        serde_json::json!({ "banned": banned, "tracked": tracked })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BanEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
