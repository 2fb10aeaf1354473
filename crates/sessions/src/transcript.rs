//! Append-only JSONL transcripts.
//!
//! Each session gets a `<sessionId>.jsonl` file under the sessions
//! directory (topic-threaded surfaces get `<sessionId>.topic-<tid>.jsonl`).
//! Turns are never edited after append; compaction writes a new
//! `system_note` turn that logically replaces a prefix.  Sequence numbers
//! are monotonic within a session file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sb_domain::error::{Error, Result};
use sb_domain::message::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single transcript turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    /// Monotonic within a session file.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TurnKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnKind {
    User {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        tool_name: String,
        /// SHA-256 of the call arguments, hex-encoded.
        args_hash: String,
        payload: String,
        size: usize,
        #[serde(default)]
        is_error: bool,
    },
    SystemNote {
        content: String,
        /// Set on session-header notes forked from a thread.
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_session: Option<String>,
    },
}

impl TurnKind {
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// Hex-encoded SHA-256 of a tool call's arguments.
pub fn args_hash(arguments: &serde_json::Value) -> String {
    let raw = serde_json::to_string(arguments).unwrap_or_default();
    hex::encode(Sha256::digest(raw.as_bytes()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Writes append-only JSONL transcript files.  The per-session file is
/// single-writer: the lane that owns the session's active run.
pub struct TranscriptWriter {
    base_dir: PathBuf,
    /// file stem → next sequence number.
    next_seq: Mutex<HashMap<String, u64>>,
}

impl TranscriptWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            next_seq: Mutex::new(HashMap::new()),
        }
    }

    fn stem(session_id: &str, topic: Option<&str>) -> String {
        match topic {
            Some(tid) => format!("{session_id}.topic-{tid}"),
            None => session_id.to_owned(),
        }
    }

    fn path_for(&self, stem: &str) -> PathBuf {
        self.base_dir.join(format!("{stem}.jsonl"))
    }

    /// Append turns to a session's transcript, assigning sequence numbers.
    /// Returns the assigned turns.
    pub fn append(
        &self,
        session_id: &str,
        topic: Option<&str>,
        turns: Vec<(DateTime<Utc>, TurnKind)>,
    ) -> Result<Vec<TranscriptTurn>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        let stem = Self::stem(session_id, topic);
        let path = self.path_for(&stem);

        let mut seqs = self.next_seq.lock();
        let next = match seqs.get(&stem) {
            Some(n) => *n,
            None => self.count_lines(&path)? as u64,
        };

        let mut assigned = Vec::with_capacity(turns.len());
        let mut buf = String::new();
        for (i, (timestamp, kind)) in turns.into_iter().enumerate() {
            let turn = TranscriptTurn { seq: next + i as u64, timestamp, kind };
            buf.push_str(&serde_json::to_string(&turn)?);
            buf.push('\n');
            assigned.push(turn);
        }

        use std::io::Write;
        std::fs::create_dir_all(&self.base_dir).map_err(Error::Io)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;

        seqs.insert(stem, next + assigned.len() as u64);

        tracing::debug!(
            session_id,
            lines = assigned.len(),
            "transcript append"
        );
        Ok(assigned)
    }

    /// Read back a transcript.  Malformed lines are skipped with a warning
    /// (store_corrupt policy: log + continue).
    pub fn read(&self, session_id: &str, topic: Option<&str>) -> Result<Vec<TranscriptTurn>> {
        let path = self.path_for(&Self::stem(session_id, topic));
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut turns = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptTurn>(line) {
                Ok(t) => turns.push(t),
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(turns)
    }

    fn count_lines(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        Ok(raw.lines().filter(|l| !l.trim().is_empty()).count())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> (DateTime<Utc>, TurnKind) {
        (Utc::now(), TurnKind::User { content: content.into(), sender: None })
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());

        let first = writer.append("s1", None, vec![user("a"), user("b")]).unwrap();
        assert_eq!(first[0].seq, 0);
        assert_eq!(first[1].seq, 1);

        let second = writer.append("s1", None, vec![user("c")]).unwrap();
        assert_eq!(second[0].seq, 2);
    }

    #[test]
    fn seq_continues_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = TranscriptWriter::new(dir.path());
            writer.append("s1", None, vec![user("a"), user("b")]).unwrap();
        }
        // Fresh writer: seq picks up from the file.
        let writer = TranscriptWriter::new(dir.path());
        let turns = writer.append("s1", None, vec![user("c")]).unwrap();
        assert_eq!(turns[0].seq, 2);
    }

    #[test]
    fn topic_suffix_separates_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());

        writer.append("s1", None, vec![user("main")]).unwrap();
        writer.append("s1", Some("t9"), vec![user("topic")]).unwrap();

        let main = writer.read("s1", None).unwrap();
        let topic = writer.read("s1", Some("t9")).unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(topic.len(), 1);
        match &topic[0].kind {
            TurnKind::User { content, .. } => assert_eq!(content, "topic"),
            other => panic!("unexpected turn: {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append("s1", None, vec![user("ok")]).unwrap();

        use std::io::Write;
        let path = dir.path().join("s1.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();

        let turns = writer.read("s1", None).unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn args_hash_is_stable() {
        let a = serde_json::json!({"q": "x", "n": 3});
        let b = serde_json::json!({"q": "x", "n": 3});
        assert_eq!(args_hash(&a), args_hash(&b));
        assert_eq!(args_hash(&a).len(), 64);
    }

    #[test]
    fn tool_result_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let kind = TurnKind::ToolResult {
            tool_name: "web_search".into(),
            args_hash: "ab".repeat(32),
            payload: "result".into(),
            size: 6,
            is_error: false,
        };
        writer.append("s1", None, vec![(Utc::now(), kind)]).unwrap();
        let turns = writer.read("s1", None).unwrap();
        assert!(turns[0].kind.is_tool_result());
    }
}
