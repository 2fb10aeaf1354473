//! System prompt composition.
//!
//! Sections are emitted in a fixed order so the prompt prefix stays stable
//! across runs of the same session (prompt-cache friendliness).  The
//! date-and-time section carries the zone and calendar date only, never a
//! live clock.

use chrono::Utc;
use chrono_tz::Tz;

use sb_domain::config::ReasoningVisibility;
use sb_domain::message::ToolDefinition;

use super::bootstrap::BootstrapFile;

pub struct PromptInputs<'a> {
    pub agent_id: &'a str,
    pub tools: &'a [ToolDefinition],
    /// (name, description) pairs; metadata only, bodies are never inlined.
    pub skills: &'a [(String, String)],
    pub self_update_notes: Option<&'a str>,
    pub workspace_path: Option<&'a str>,
    pub docs_pointer: Option<&'a str>,
    pub bootstrap: &'a [BootstrapFile],
    pub sandboxed: bool,
    pub timezone: Option<&'a str>,
    pub heartbeat_directives: Option<&'a str>,
    pub channel: &'a str,
    pub reasoning: ReasoningVisibility,
}

/// Compose the system prompt.  Section order is fixed:
/// tooling → skills → self-update → workspace → docs → project context →
/// sandbox → date/zone → heartbeat → runtime metadata → reasoning.
pub fn compose_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::with_capacity(4096);

    // Tooling summary.
    if inputs.tools.is_empty() {
        out.push_str("## Tooling\nNo tools are available this run.\n");
    } else {
        out.push_str("## Tooling\n");
        for tool in inputs.tools {
            out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
    }

    // Skills list (metadata only).
    if !inputs.skills.is_empty() {
        out.push_str("\n## Skills\n");
        for (name, description) in inputs.skills {
            out.push_str(&format!("- {name}: {description}\n"));
        }
    }

    if let Some(notes) = inputs.self_update_notes {
        out.push_str("\n## Self-update\n");
        out.push_str(notes);
        out.push('\n');
    }

    if let Some(workspace) = inputs.workspace_path {
        out.push_str(&format!("\n## Workspace\nYour workspace is at `{workspace}`.\n"));
    }

    if let Some(docs) = inputs.docs_pointer {
        out.push_str(&format!("\n## Documentation\n{docs}\n"));
    }

    // Injected project context (bootstrap files).
    out.push_str("\n## Project context\n");
    for file in inputs.bootstrap {
        out.push_str(&format!("\n### {} ({})\n{}\n", file.name, file.label, file.content));
    }

    if inputs.sandboxed {
        out.push_str("\n## Sandbox\nYou are running in a sandboxed environment.\n");
    }

    // Zone and date only; no live clock, for prompt-cache stability.
    let tz: Tz = inputs
        .timezone
        .and_then(|name| name.parse().ok())
        .unwrap_or(chrono_tz::UTC);
    let today = Utc::now().with_timezone(&tz).date_naive();
    out.push_str(&format!(
        "\n## Date\nToday is {today} in the {tz} timezone. \
         The exact time is not provided.\n"
    ));

    if let Some(heartbeat) = inputs.heartbeat_directives {
        out.push_str("\n## Heartbeat\n");
        out.push_str(heartbeat);
        out.push('\n');
    }

    out.push_str(&format!(
        "\n## Runtime\nagent: {}\nchannel: {}\n",
        inputs.agent_id, inputs.channel
    ));

    match inputs.reasoning {
        ReasoningVisibility::Hidden => {
            out.push_str("\nYour reasoning is not shown to the user.\n");
        }
        ReasoningVisibility::On => {
            out.push_str("\nYour reasoning may be shown to the user verbatim.\n");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(bootstrap: &'a [BootstrapFile], tools: &'a [ToolDefinition]) -> PromptInputs<'a> {
        PromptInputs {
            agent_id: "bot1",
            tools,
            skills: &[],
            self_update_notes: None,
            workspace_path: Some("/srv/bot1"),
            docs_pointer: None,
            bootstrap,
            sandboxed: false,
            timezone: Some("Europe/Paris"),
            heartbeat_directives: None,
            channel: "telegram",
            reasoning: ReasoningVisibility::Hidden,
        }
    }

    #[test]
    fn section_order_is_fixed() {
        let bootstrap = vec![BootstrapFile {
            name: "IDENTITY.md".into(),
            label: "identity".into(),
            content: "I am a bot".into(),
            truncated: false,
            missing: false,
        }];
        let tools = vec![ToolDefinition {
            name: "web_search".into(),
            description: "search the web".into(),
            parameters: serde_json::json!({}),
        }];
        let prompt = compose_system_prompt(&inputs(&bootstrap, &tools));

        let tooling = prompt.find("## Tooling").unwrap();
        let workspace = prompt.find("## Workspace").unwrap();
        let context = prompt.find("## Project context").unwrap();
        let date = prompt.find("## Date").unwrap();
        let runtime = prompt.find("## Runtime").unwrap();
        assert!(tooling < workspace && workspace < context && context < date && date < runtime);
    }

    #[test]
    fn date_section_has_no_clock() {
        let prompt = compose_system_prompt(&inputs(&[], &[]));
        assert!(prompt.contains("Europe/Paris"));
        // No HH:MM anywhere in the date section.
        let date_section = prompt.split("## Date").nth(1).unwrap();
        let head = date_section.split("##").next().unwrap();
        assert!(!head.contains(':'), "date section leaks a clock: {head}");
    }

    #[test]
    fn reasoning_directive_follows_visibility() {
        let mut i = inputs(&[], &[]);
        i.reasoning = ReasoningVisibility::On;
        let prompt = compose_system_prompt(&i);
        assert!(prompt.contains("may be shown"));
    }
}
