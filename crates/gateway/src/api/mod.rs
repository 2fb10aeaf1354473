//! Control-plane server: a WebSocket carrying one JSON frame per request,
//! plus a plain HTTP health probe.

pub mod control;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;

use crate::state::AppState;

/// Short-lived response cache keyed by idempotency key, so client retries
/// are safe.
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, (Instant, serde_json::Value)>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    pub fn put(&self, key: &str, value: serde_json::Value) {
        let mut entries = self.entries.lock();
        if entries.len() > 10_000 {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() < ttl);
        }
        entries.insert(key.to_owned(), (Instant::now(), value));
    }
}

/// Build the axum router for the control plane.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(control::ws_handler))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_cache_roundtrip() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.put("k", serde_json::json!({"n": 1}));
        assert_eq!(cache.get("k").unwrap()["n"], 1);
    }

    #[test]
    fn idempotency_cache_expires() {
        let cache = IdempotencyCache::new(Duration::ZERO);
        cache.put("k", serde_json::json!(1));
        assert!(cache.get("k").is_none());
    }
}
