//! Context pruning — trim old tool results before each model call.
//!
//! Runs synchronously on the in-memory prompt; persisted history is never
//! rewritten.  Policy:
//! - `cache-ttl` mode only prunes when the session's last model call is
//!   older than the TTL, so a hot prompt cache is never invalidated.
//! - Only tool-result content is eligible; user/assistant turns are never
//!   touched.
//! - Tool results after the last `keep_last_assistants` assistant turns
//!   are protected.
//! - Turns containing image payloads are skipped.
//! - Moderately oversized results soft-trim (head + tail + size note);
//!   very large ones hard-clear to a placeholder.

use chrono::{DateTime, Duration, Utc};

use sb_domain::config::{PruningConfig, PruningMode};
use sb_domain::message::{ContentPart, Message, MessageContent, Role};

/// Chars-per-token multiplier for the context-window estimate.  Cheap and
/// deliberately approximate.
const CHARS_PER_TOKEN: usize = 4;

/// Whether pruning should run at all for this session right now.
pub fn prune_due(
    config: &PruningConfig,
    last_model_call: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match config.mode {
        PruningMode::Off => false,
        PruningMode::CacheTtl => match last_model_call {
            // No prior call: nothing is cached, but nothing is stale either.
            None => false,
            Some(last) => now - last >= Duration::seconds(config.ttl_secs as i64),
        },
    }
}

/// Prune a message list, returning a new copy.  A list with no eligible
/// turns comes back unchanged (idempotent).
pub fn prune_messages(messages: &[Message], config: &PruningConfig) -> Vec<Message> {
    let cutoff = find_protection_cutoff(messages, config.keep_last_assistants);

    let window_chars = config.context_window_tokens * CHARS_PER_TOKEN;
    let soft_threshold = (window_chars as f64 * config.soft_trim_ratio) as usize;
    let hard_threshold = (window_chars as f64 * config.hard_clear_ratio) as usize;

    let mut result = Vec::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        if msg.role != Role::Tool || i >= cutoff {
            result.push(msg.clone());
            continue;
        }

        if contains_image(&msg.content) {
            result.push(msg.clone());
            continue;
        }

        if !needs_pruning(&msg.content, config.min_prunable_chars, soft_threshold) {
            result.push(msg.clone());
            continue;
        }

        result.push(Message {
            role: msg.role,
            content: prune_tool_content(&msg.content, config, soft_threshold, hard_threshold),
        });
    }
    result
}

/// Index before which tool results are eligible.  Everything at
/// `>= cutoff` is protected.
fn find_protection_cutoff(messages: &[Message], keep_last_assistants: usize) -> usize {
    if keep_last_assistants == 0 {
        return messages.len();
    }

    let mut assistant_count = 0;
    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::Assistant {
            assistant_count += 1;
            if assistant_count >= keep_last_assistants {
                return i;
            }
        }
    }
    // Not enough assistant turns to protect: don't prune anything.
    messages.len()
}

fn needs_pruning(content: &MessageContent, min_chars: usize, soft_threshold: usize) -> bool {
    let eligible = |text: &str| text.len() >= min_chars && text.len() >= soft_threshold;
    match content {
        MessageContent::Text(text) => eligible(text),
        MessageContent::Parts(parts) => parts.iter().any(|p| match p {
            ContentPart::ToolResult { content, .. } => eligible(content),
            _ => false,
        }),
    }
}

fn contains_image(content: &MessageContent) -> bool {
    match content {
        MessageContent::Text(_) => false,
        MessageContent::Parts(parts) => {
            parts.iter().any(|p| matches!(p, ContentPart::Image { .. }))
        }
    }
}

fn prune_tool_content(
    content: &MessageContent,
    config: &PruningConfig,
    soft_threshold: usize,
    hard_threshold: usize,
) -> MessageContent {
    match content {
        MessageContent::Text(text) => {
            MessageContent::Text(prune_text(text, config, soft_threshold, hard_threshold))
        }
        MessageContent::Parts(parts) => MessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::ToolResult { tool_use_id, content, is_error } => {
                        ContentPart::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: prune_text(content, config, soft_threshold, hard_threshold),
                            is_error: *is_error,
                        }
                    }
                    other => other.clone(),
                })
                .collect(),
        ),
    }
}

fn prune_text(
    text: &str,
    config: &PruningConfig,
    soft_threshold: usize,
    hard_threshold: usize,
) -> String {
    let len = text.len();
    if len < config.min_prunable_chars {
        return text.to_owned();
    }

    if config.hard_clear.enabled && len >= hard_threshold {
        return format!("{}\n(original size: {len} chars)", config.hard_clear.placeholder);
    }

    if len >= soft_threshold {
        let head = floor_char_boundary(text, config.soft_trim.head_chars.min(len));
        let tail_len = config.soft_trim.tail_chars.min(len.saturating_sub(head));
        let tail_start = ceil_char_boundary(text, len - tail_len);
        return format!(
            "{}\n\n… [{} chars trimmed] …\n\n{}\n(original size: {len} chars)",
            &text[..head],
            tail_start - head,
            &text[tail_start..]
        );
    }

    text.to_owned()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
