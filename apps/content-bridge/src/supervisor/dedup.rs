use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Recently seen inbound message ids. Expired entries are purged lazily
/// whenever a new id is observed.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Records `id` and returns `true` on its first sighting within the window.
    pub fn observe(&mut self, id: &str, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
