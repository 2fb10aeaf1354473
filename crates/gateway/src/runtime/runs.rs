//! Run tracking — execution records for every agent run.
//!
//! Each dispatched job produces a `RunRecord` keyed by its run UUID.  Runs
//! are persisted to a JSONL file and kept in a bounded in-memory ring with
//! an O(1) index for `status` queries and waiter lookups.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sb_domain::error::{ErrorKind, RunStatus};

use super::truncate_str;

const MAX_RUNS_IN_MEMORY: usize = 2000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub session_key: String,
    pub session_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub accepted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// First ~200 chars of the merged job body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    /// First ~200 chars of the final assistant payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    /// Full final payload; held in memory for delivery, never persisted.
    #[serde(skip)]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
}

impl RunRecord {
    pub fn new(
        run_id: Uuid,
        session_key: String,
        session_id: String,
        agent_id: String,
        accepted_at: DateTime<Utc>,
        body: &str,
    ) -> Self {
        Self {
            run_id,
            session_key,
            session_id,
            agent_id,
            status: RunStatus::Accepted,
            accepted_at,
            started_at: None,
            ended_at: None,
            error_kind: None,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            input_preview: Some(truncate_str(body, 200)),
            output_preview: None,
            final_text: None,
            parent_run_id: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunStore {
    inner: RwLock<RunStoreInner>,
    log_path: PathBuf,
}

/// VecDeque plus a run_id → logical sequence index.  The logical offset
/// tracks how many entries were popped from the front so index values
/// never need bulk adjustment.
struct RunStoreInner {
    runs: VecDeque<RunRecord>,
    index: HashMap<Uuid, usize>,
    base_seq: usize,
}

impl RunStoreInner {
    fn new(runs: VecDeque<RunRecord>) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            index.insert(run.run_id, i);
        }
        Self { runs, index, base_seq: 0 }
    }

    fn get(&self, run_id: &Uuid) -> Option<&RunRecord> {
        let seq = *self.index.get(run_id)?;
        self.runs.get(seq - self.base_seq)
    }

    fn get_mut(&mut self, run_id: &Uuid) -> Option<&mut RunRecord> {
        let seq = *self.index.get(run_id)?;
        let idx = seq - self.base_seq;
        self.runs.get_mut(idx)
    }

    fn push_back(&mut self, run: RunRecord) {
        let seq = self.base_seq + self.runs.len();
        self.index.insert(run.run_id, seq);
        self.runs.push_back(run);
    }

    fn pop_front(&mut self) {
        if let Some(run) = self.runs.pop_front() {
            self.index.remove(&run.run_id);
            self.base_seq += 1;
        }
    }
}

impl RunStore {
    pub fn new(state_path: &Path) -> Self {
        let dir = state_path.join("runs");
        std::fs::create_dir_all(&dir).ok();
        let log_path = dir.join("runs.jsonl");
        let runs = Self::load_recent(&log_path);
        Self { inner: RwLock::new(RunStoreInner::new(runs)), log_path }
    }

    fn load_recent(path: &Path) -> VecDeque<RunRecord> {
        let mut runs = VecDeque::new();
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            for line in lines.iter().rev().take(MAX_RUNS_IN_MEMORY) {
                if let Ok(run) = serde_json::from_str::<RunRecord>(line) {
                    runs.push_front(run);
                }
            }
        }
        runs
    }

    pub fn insert(&self, run: RunRecord) {
        let mut inner = self.inner.write();
        inner.push_back(run);
        if inner.runs.len() > MAX_RUNS_IN_MEMORY {
            inner.pop_front();
        }
    }

    /// Update a run in place.  Returns true when found.
    pub fn update<F>(&self, run_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut inner = self.inner.write();
        match inner.get_mut(run_id) {
            Some(run) => {
                f(run);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, run_id: &Uuid) -> Option<RunRecord> {
        self.inner.read().get(run_id).cloned()
    }

    /// Append the terminal record to the JSONL log.
    pub fn persist(&self, run: &RunRecord) {
        if let Ok(json) = serde_json::to_string(run) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    /// Recent runs, newest first, with optional filters.
    pub fn list(
        &self,
        status: Option<RunStatus>,
        session_key: Option<&str>,
        limit: usize,
    ) -> Vec<RunRecord> {
        let inner = self.inner.read();
        inner
            .runs
            .iter()
            .rev()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .filter(|r| session_key.is_none_or(|k| r.session_key.eq_ignore_ascii_case(k)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn status_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for run in inner.runs.iter() {
            let key = serde_json::to_value(run.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| format!("{:?}", run.status).to_lowercase());
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_key: &str, body: &str) -> RunRecord {
        RunRecord::new(
            Uuid::new_v4(),
            session_key.into(),
            "sid".into(),
            "bot1".into(),
            Utc::now(),
            body,
        )
    }

    #[test]
    fn insert_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let run = record("sk1", "hello");
        let run_id = run.run_id;
        store.insert(run);

        assert!(store.update(&run_id, |r| r.finish(RunStatus::Ok)));
        let fetched = store.get(&run_id).unwrap();
        assert_eq!(fetched.status, RunStatus::Ok);
        assert!(fetched.ended_at.is_some());
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let run = {
            let store = RunStore::new(dir.path());
            let mut run = record("sk1", "msg");
            run.finish(RunStatus::Timeout);
            store.insert(run.clone());
            store.persist(&run);
            run
        };

        let store = RunStore::new(dir.path());
        let fetched = store.get(&run.run_id).unwrap();
        assert_eq!(fetched.status, RunStatus::Timeout);
    }

    #[test]
    fn bounded_ring() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        for i in 0..(MAX_RUNS_IN_MEMORY + 5) {
            store.insert(record(&format!("sk{i}"), "m"));
        }
        assert_eq!(store.list(None, None, usize::MAX).len(), MAX_RUNS_IN_MEMORY);
    }

    #[test]
    fn list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let mut a = record("alpha", "m1");
        a.status = RunStatus::Ok;
        store.insert(a);
        let b = record("beta", "m2");
        store.insert(b);

        assert_eq!(store.list(Some(RunStatus::Ok), None, 10).len(), 1);
        assert_eq!(store.list(None, Some("ALPHA"), 10).len(), 1);
        assert_eq!(store.status_counts().get("accepted"), Some(&1));
    }

    #[test]
    fn input_preview_truncated() {
        let long = "a".repeat(400);
        let run = record("sk", &long);
        assert!(run.input_preview.as_deref().unwrap().len() <= 203);
    }
}
