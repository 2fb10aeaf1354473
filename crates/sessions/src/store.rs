//! Gateway-owned session store.
//!
//! Persists one map per agent at `agents/<agentId>/sessions/sessions.json`.
//! Each session key maps to a [`SessionEntry`] tracking the stable session
//! ID, token counters, origin metadata, and provider-profile stickiness.
//! Deleting an entry is safe: it is rematerialized on the next inbound, and
//! transcript logs are the source of truth for history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};

use crate::session_key::normalize_key;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session tracked by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_key: String,
    /// Stable UUID, chosen at first creation and replaced on reset.
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Last inbound or outbound activity.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub channel: String,
    /// `dm`, `group`, `room`, or `thread`.
    #[serde(default)]
    pub chat_type: String,
    #[serde(default)]
    pub origin: SessionOrigin,
    /// Provider auth profile last used, for stickiness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_profile_id: Option<String>,
    /// Timestamp of the last model call, gating cache-TTL pruning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model_call_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Origin metadata describing where the session came from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionOrigin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Seed values for minting a new entry.
#[derive(Debug, Clone, Default)]
pub struct MintSeed {
    pub display_name: Option<String>,
    pub channel: String,
    pub chat_type: String,
    pub origin: SessionOrigin,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session store backed by one JSON file per agent.
pub struct SessionStore {
    state_path: PathBuf,
    /// agent_id → (normalized key → entry).  Maps load lazily.
    maps: RwLock<HashMap<String, HashMap<String, SessionEntry>>>,
}

impl SessionStore {
    pub fn new(state_path: &Path) -> Self {
        Self {
            state_path: state_path.to_path_buf(),
            maps: RwLock::new(HashMap::new()),
        }
    }

    /// Directory holding an agent's session map and transcripts.
    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.state_path.join("agents").join(agent_id).join("sessions")
    }

    fn map_path(&self, agent_id: &str) -> PathBuf {
        self.sessions_dir(agent_id).join("sessions.json")
    }

    fn ensure_loaded(&self, agent_id: &str) {
        if self.maps.read().contains_key(agent_id) {
            return;
        }

        let path = self.map_path(agent_id);
        let loaded: HashMap<String, SessionEntry> = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(map) => map,
                    Err(e) => {
                        // store_corrupt: log + continue with a fresh map.
                        tracing::warn!(
                            agent_id,
                            error = %e,
                            "session map corrupt, starting fresh"
                        );
                        HashMap::new()
                    }
                },
                Err(e) => {
                    tracing::warn!(agent_id, error = %e, "session map unreadable");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut maps = self.maps.write();
        maps.entry(agent_id.to_owned()).or_insert_with(|| {
            tracing::info!(agent_id, sessions = loaded.len(), "session store loaded");
            loaded
        });
    }

    fn save(&self, agent_id: &str) -> Result<()> {
        let maps = self.maps.read();
        let Some(map) = maps.get(agent_id) else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(map)?;
        let dir = self.sessions_dir(agent_id);
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        std::fs::write(self.map_path(agent_id), json).map_err(Error::Io)?;
        Ok(())
    }

    /// Look up a session by key.
    pub fn get(&self, agent_id: &str, session_key: &str) -> Option<SessionEntry> {
        self.ensure_loaded(agent_id);
        self.maps
            .read()
            .get(agent_id)
            .and_then(|m| m.get(&normalize_key(session_key)))
            .cloned()
    }

    /// Resolve or create a session for the given key.  Returns
    /// `(entry, is_new)`.
    pub fn resolve_or_create(
        &self,
        agent_id: &str,
        session_key: &str,
        seed: MintSeed,
    ) -> (SessionEntry, bool) {
        self.ensure_loaded(agent_id);
        let key = normalize_key(session_key);

        // Fast path: session already exists.
        {
            let maps = self.maps.read();
            if let Some(entry) = maps.get(agent_id).and_then(|m| m.get(&key)) {
                return (entry.clone(), false);
            }
        }

        let entry = mint_entry(&key, seed);
        {
            let mut maps = self.maps.write();
            maps.entry(agent_id.to_owned())
                .or_default()
                .insert(key.clone(), entry.clone());
        }
        if let Err(e) = self.save(agent_id) {
            tracing::warn!(agent_id, error = %e, "session map save failed");
        }

        tracing::info!(
            agent_id,
            session_key = %key,
            session_id = %entry.session_id,
            "new session created"
        );
        (entry, true)
    }

    /// Mint a new session ID for the same key (reset).  Returns
    /// `(old_session_id, new_entry)` if the key existed.
    pub fn reset_session(
        &self,
        agent_id: &str,
        session_key: &str,
        reason: &str,
    ) -> Option<(String, SessionEntry)> {
        self.ensure_loaded(agent_id);
        let key = normalize_key(session_key);

        let result = {
            let mut maps = self.maps.write();
            let entry = maps.get_mut(agent_id)?.get_mut(&key)?;

            let old_id = entry.session_id.clone();
            let now = Utc::now();
            entry.session_id = uuid::Uuid::new_v4().to_string();
            entry.created_at = now;
            entry.updated_at = now;
            entry.last_model_call_at = None;
            entry.compaction_count = 0;
            entry.input_tokens = 0;
            entry.output_tokens = 0;
            entry.total_tokens = 0;
            Some((old_id, entry.clone()))
        };

        if let Some((ref old_id, ref entry)) = result {
            if let Err(e) = self.save(agent_id) {
                tracing::warn!(agent_id, error = %e, "session map save failed");
            }
            tracing::info!(
                agent_id,
                session_key = %key,
                old_session_id = %old_id,
                new_session_id = %entry.session_id,
                reason,
                "session reset"
            );
        }
        result
    }

    /// Apply a mutation to an entry.  Returns false when the key is absent.
    pub fn update<F>(&self, agent_id: &str, session_key: &str, f: F) -> bool
    where
        F: FnOnce(&mut SessionEntry),
    {
        self.ensure_loaded(agent_id);
        let key = normalize_key(session_key);
        let mut maps = self.maps.write();
        match maps.get_mut(agent_id).and_then(|m| m.get_mut(&key)) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Update token counters and touch `updated_at`.
    pub fn record_usage(
        &self,
        agent_id: &str,
        session_key: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.update(agent_id, session_key, |entry| {
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_tokens += input_tokens + output_tokens;
            entry.updated_at = Utc::now();
        });
    }

    /// Touch the `updated_at` timestamp.
    pub fn touch(&self, agent_id: &str, session_key: &str) {
        self.update(agent_id, session_key, |entry| {
            entry.updated_at = Utc::now();
        });
    }

    /// Record a model call for cache-TTL gating.
    pub fn mark_model_call(&self, agent_id: &str, session_key: &str, at: DateTime<Utc>) {
        self.update(agent_id, session_key, |entry| {
            entry.last_model_call_at = Some(at);
        });
    }

    /// Delete an entry.  The transcript log is left in place.
    pub fn delete(&self, agent_id: &str, session_key: &str) -> bool {
        self.ensure_loaded(agent_id);
        let key = normalize_key(session_key);
        let removed = {
            let mut maps = self.maps.write();
            maps.get_mut(agent_id).and_then(|m| m.remove(&key)).is_some()
        };
        if removed {
            if let Err(e) = self.save(agent_id) {
                tracing::warn!(agent_id, error = %e, "session map save failed");
            }
        }
        removed
    }

    /// List all session entries for an agent.
    pub fn list(&self, agent_id: &str) -> Vec<SessionEntry> {
        self.ensure_loaded(agent_id);
        self.maps
            .read()
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Persist all loaded maps.
    pub fn flush(&self) -> Result<()> {
        let agents: Vec<String> = self.maps.read().keys().cloned().collect();
        for agent_id in agents {
            self.save(&agent_id)?;
        }
        Ok(())
    }
}

fn mint_entry(key: &str, seed: MintSeed) -> SessionEntry {
    let now = Utc::now();
    SessionEntry {
        session_key: key.to_owned(),
        session_id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        display_name: seed.display_name,
        channel: seed.channel,
        chat_type: seed.chat_type,
        origin: seed.origin,
        last_profile_id: None,
        last_model_call_at: None,
        compaction_count: 0,
        input_tokens: 0,
        output_tokens: 0,
        total_tokens: 0,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> MintSeed {
        MintSeed {
            display_name: None,
            channel: "telegram".into(),
            chat_type: "dm".into(),
            origin: SessionOrigin::default(),
        }
    }

    #[test]
    fn resolve_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let (a, is_new) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(is_new);
        let (b, is_new) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(!is_new);
        assert_eq!(a.session_id, b.session_id);
    }

    #[test]
    fn keys_compare_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let (a, _) = store.resolve_or_create("bot1", "Agent:Bot1:Main", seed());
        let (b, is_new) = store.resolve_or_create("bot1", "agent:bot1:MAIN", seed());
        assert!(!is_new);
        assert_eq!(a.session_id, b.session_id);
    }

    #[test]
    fn reset_mints_new_id_and_zeroes_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let (entry, _) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        store.record_usage("bot1", "agent:bot1:main", 100, 50);

        let (old_id, fresh) = store.reset_session("bot1", "agent:bot1:main", "test").unwrap();
        assert_eq!(old_id, entry.session_id);
        assert_ne!(fresh.session_id, entry.session_id);
        assert_eq!(fresh.total_tokens, 0);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = {
            let store = SessionStore::new(dir.path());
            let (entry, _) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
            entry.session_id
        };

        let store = SessionStore::new(dir.path());
        let entry = store.get("bot1", "agent:bot1:main").unwrap();
        assert_eq!(entry.session_id, session_id);
    }

    #[test]
    fn delete_is_safe_and_rematerializes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let (a, _) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(store.delete("bot1", "agent:bot1:main"));
        assert!(store.get("bot1", "agent:bot1:main").is_none());

        let (b, is_new) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(is_new);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn agents_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(store.get("bot2", "agent:bot1:main").is_none());
        assert_eq!(store.list("bot1").len(), 1);
        assert!(store.list("bot2").is_empty());
    }

    #[test]
    fn corrupt_map_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("agents/bot1/sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(sessions.join("sessions.json"), "{broken").unwrap();

        let store = SessionStore::new(dir.path());
        assert!(store.get("bot1", "agent:bot1:main").is_none());
        let (_, is_new) = store.resolve_or_create("bot1", "agent:bot1:main", seed());
        assert!(is_new);
    }
}
