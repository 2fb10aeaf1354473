//! Auth-profile selection: stickiness, rotation, cooldown.
//!
//! A profile is an opaque credential identity (`"anthropic:work"`).  The
//! gateway never sees secrets; it only tracks which profile a session last
//! used and which profiles are cooling down after failures.  Auth,
//! rate-limit, and rate-like timeout failures rotate the profile with an
//! escalating cooldown; billing exhaustion disables the profile for a long
//! window.  State persists to a per-agent JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sb_domain::error::ErrorKind;

const BASE_COOLDOWN: Duration = Duration::from_secs(60);
const MAX_COOLDOWN: Duration = Duration::from_secs(3600);
const BILLING_DISABLE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ProfileState {
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unavailable_until: Option<DateTime<Utc>>,
}

/// Tracks availability of the configured auth profiles for one agent.
pub struct ProfileRegistry {
    path: PathBuf,
    /// Declaration order drives rotation order.
    order: Vec<String>,
    states: Mutex<HashMap<String, ProfileState>>,
}

impl ProfileRegistry {
    /// Load state from `path` (missing or corrupt files start fresh) and
    /// register the configured profile IDs.
    pub fn load(path: &Path, profile_ids: &[String]) -> Self {
        let states: HashMap<String, ProfileState> = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Self {
            path: path.to_path_buf(),
            order: profile_ids.to_vec(),
            states: Mutex::new(states),
        }
    }

    /// Pick a profile: the sticky one if it is still available, otherwise
    /// the first available in declaration order.
    pub fn select(&self, sticky: Option<&str>, now: DateTime<Utc>) -> Option<String> {
        let states = self.states.lock();
        let available = |id: &str| {
            states
                .get(id)
                .and_then(|s| s.unavailable_until)
                .is_none_or(|until| now >= until)
        };

        if let Some(sticky) = sticky {
            if self.order.iter().any(|id| id == sticky) && available(sticky) {
                return Some(sticky.to_owned());
            }
        }

        self.order.iter().find(|id| available(id)).cloned()
    }

    /// Record a model-layer failure against a profile.  Returns `true` when
    /// the failure put the profile on cooldown (callers should rotate).
    pub fn report_failure(&self, profile_id: &str, kind: ErrorKind, now: DateTime<Utc>) -> bool {
        let rotated = {
            let mut states = self.states.lock();
            let state = states.entry(profile_id.to_owned()).or_default();

            match kind {
                ErrorKind::BillingExhausted => {
                    state.unavailable_until =
                        Some(now + chrono::Duration::seconds(BILLING_DISABLE.as_secs() as i64));
                    tracing::warn!(profile_id, "billing exhausted, disabling profile");
                    true
                }
                kind if kind.rotates_profile() => {
                    state.consecutive_failures += 1;
                    let cooldown = cooldown_for(state.consecutive_failures);
                    state.unavailable_until =
                        Some(now + chrono::Duration::seconds(cooldown.as_secs() as i64));
                    tracing::warn!(
                        profile_id,
                        %kind,
                        failures = state.consecutive_failures,
                        cooldown_secs = cooldown.as_secs(),
                        "profile on cooldown"
                    );
                    true
                }
                _ => false,
            }
        };
        if rotated {
            self.save();
        }
        rotated
    }

    /// Clear cooldown escalation after a successful call.
    pub fn report_success(&self, profile_id: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(profile_id) {
            state.consecutive_failures = 0;
            state.unavailable_until = None;
        }
    }

    fn save(&self) {
        let states = self.states.lock();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*states) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %e, "profile state save failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "profile state serialize failed"),
        }
    }
}

fn cooldown_for(failures: u32) -> Duration {
    let exp = BASE_COOLDOWN.as_secs().saturating_mul(1u64 << (failures.saturating_sub(1)).min(8));
    Duration::from_secs(exp.min(MAX_COOLDOWN.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn sticky_profile_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a", "b"]));
        let now = Utc::now();
        assert_eq!(reg.select(Some("b"), now).as_deref(), Some("b"));
        assert_eq!(reg.select(None, now).as_deref(), Some("a"));
    }

    #[test]
    fn failure_rotates_to_next() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a", "b"]));
        let now = Utc::now();

        assert!(reg.report_failure("a", ErrorKind::RateLimit, now));
        assert_eq!(reg.select(Some("a"), now).as_deref(), Some("b"));
    }

    #[test]
    fn cooldown_expires() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a"]));
        let now = Utc::now();

        reg.report_failure("a", ErrorKind::Auth, now);
        assert_eq!(reg.select(None, now), None);
        // After the 60s base cooldown the profile is usable again.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(reg.select(None, later).as_deref(), Some("a"));
    }

    #[test]
    fn cooldown_escalates() {
        assert_eq!(cooldown_for(1), Duration::from_secs(60));
        assert_eq!(cooldown_for(2), Duration::from_secs(120));
        assert_eq!(cooldown_for(3), Duration::from_secs(240));
        assert_eq!(cooldown_for(30), MAX_COOLDOWN);
    }

    #[test]
    fn billing_disable_is_long() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a"]));
        let now = Utc::now();

        reg.report_failure("a", ErrorKind::BillingExhausted, now);
        let in_an_hour = now + chrono::Duration::hours(1);
        assert_eq!(reg.select(None, in_an_hour), None);
        let next_day = now + chrono::Duration::hours(25);
        assert_eq!(reg.select(None, next_day).as_deref(), Some("a"));
    }

    #[test]
    fn fatal_errors_do_not_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a"]));
        let now = Utc::now();
        assert!(!reg.report_failure("a", ErrorKind::ProviderFatal, now));
        assert_eq!(reg.select(None, now).as_deref(), Some("a"));
    }

    #[test]
    fn success_clears_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ProfileRegistry::load(&dir.path().join("p.json"), &ids(&["a"]));
        let now = Utc::now();

        reg.report_failure("a", ErrorKind::RateLimit, now);
        reg.report_success("a");
        assert_eq!(reg.select(None, now).as_deref(), Some("a"));
    }

    #[test]
    fn state_persists_across_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let now = Utc::now();
        {
            let reg = ProfileRegistry::load(&path, &ids(&["a"]));
            reg.report_failure("a", ErrorKind::BillingExhausted, now);
        }
        let reg = ProfileRegistry::load(&path, &ids(&["a"]));
        assert_eq!(reg.select(None, now + chrono::Duration::hours(1)), None);
    }
}
