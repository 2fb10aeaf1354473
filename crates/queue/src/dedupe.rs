//! Inbound idempotency.
//!
//! Tracks seen `(channel, account, peer, messageId)` keys with a short TTL
//! to drop duplicate deliveries from webhook retries, reconnects, and
//! polling replays.  The set is size-capped with oldest-first eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct DedupeStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    cap: usize,
}

impl DedupeStore {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            cap: cap.max(1),
        }
    }

    /// Returns `true` if this key was already seen within the TTL
    /// (duplicate).  Fresh keys are recorded.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Instant::now())
    }

    pub fn check_and_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut map = self.seen.lock();

        if let Some(ts) = map.get(key) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }

        map.insert(key.to_owned(), now);

        if map.len() > self.cap {
            // Expired entries first, then oldest-first until under cap.
            let ttl = self.ttl;
            map.retain(|_, ts| now.duration_since(*ts) < ttl);
            while map.len() > self.cap {
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, ts)| **ts)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&oldest);
                }
            }
        }

        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
