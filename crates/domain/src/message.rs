//! The in-memory prompt model: messages, content parts, and tool calls.
//!
//! This is what the agent runner assembles before each model call and what
//! the context pruner rewrites.  Persisted transcript turns are a separate
//! type (`sb-sessions`); pruning only ever touches this in-memory form.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: &str) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.to_owned()) }
    }

    pub fn user(text: &str) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.to_owned()) }
    }

    pub fn assistant(text: &str) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.to_owned()) }
    }

    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: call_id.to_owned(),
                content: content.to_owned(),
                is_error: false,
            }]),
        }
    }

    /// Flatten the content to plain text (images skipped).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ToolResult { content, .. } => Some(content.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A completed tool invocation request from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// A tool made available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_flattening_skips_images() {
        let msg = Message {
            role: Role::Tool,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "a".into() },
                ContentPart::Image { media_type: "image/png".into(), data: "…".into() },
                ContentPart::ToolResult {
                    tool_use_id: "c1".into(),
                    content: "b".into(),
                    is_error: false,
                },
            ]),
        };
        assert_eq!(msg.text(), "a\nb");
    }

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool_result("c", "r").role, Role::Tool);
    }
}
