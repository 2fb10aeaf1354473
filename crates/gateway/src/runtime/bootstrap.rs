//! Workspace bootstrap files injected into the system prompt.
//!
//! Each agent workspace carries a small set of well-known files (identity,
//! personality, user profile, tool notes, heartbeat).  Files load up to a
//! per-file char cap; a missing file injects a short placeholder so the
//! prompt shape stays stable.

use std::path::Path;

/// The well-known bootstrap files, in injection order.
pub const BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("IDENTITY.md", "identity"),
    ("PERSONALITY.md", "personality"),
    ("USER.md", "user profile"),
    ("TOOLS.md", "tool notes"),
    ("HEARTBEAT.md", "heartbeat"),
];

#[derive(Debug, Clone)]
pub struct BootstrapFile {
    pub name: String,
    pub label: String,
    pub content: String,
    pub truncated: bool,
    pub missing: bool,
}

/// Load the bootstrap set from `workspace`.  `max_chars` caps each file.
pub fn load_bootstrap(workspace: Option<&Path>, max_chars: usize) -> Vec<BootstrapFile> {
    BOOTSTRAP_FILES
        .iter()
        .map(|(name, label)| load_one(workspace, name, label, max_chars))
        .collect()
}

fn load_one(
    workspace: Option<&Path>,
    name: &str,
    label: &str,
    max_chars: usize,
) -> BootstrapFile {
    let content = workspace
        .map(|w| w.join(name))
        .filter(|p| p.exists())
        .and_then(|p| std::fs::read_to_string(&p).ok());

    match content {
        Some(raw) => {
            let truncated = raw.chars().count() > max_chars;
            let content = if truncated {
                let mut cut: String = raw.chars().take(max_chars).collect();
                cut.push_str("\n… (truncated)");
                cut
            } else {
                raw
            };
            BootstrapFile {
                name: name.to_owned(),
                label: label.to_owned(),
                content,
                truncated,
                missing: false,
            }
        }
        None => BootstrapFile {
            name: name.to_owned(),
            label: label.to_owned(),
            content: format!("({label} file not present)"),
            truncated: false,
            missing: true,
        },
    }
}
