//! Conversation State
//!
//! The ordered history of one conversation, in the provider-neutral form
//! every provider renders from. Tool calls and their results are separate
//! turns so each provider can map them onto its own wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolCall, ToolResult};

/// One entry of the conversation history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    /// User input
    User { content: String },

    /// Assistant text
    AssistantText { content: String },

    /// Tool calls requested by the assistant in one model turn
    ToolCalls { calls: Vec<ToolCall> },

    /// Result answering one earlier call
    ToolResult(ToolResult),
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Turn::AssistantText { content: content.into() }
    }
}

/// Conversation history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationState {
    /// Conversation ID
    pub id: Uuid,

    /// System prompt sent ahead of the turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    turns: Vec<Turn>,

    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            system_prompt: None,
            turns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(prompt.into()),
            ..Self::new()
        }
    }

    /// Add a turn
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Turn::user(content));
    }

    /// Append one model turn's calls followed by their results.
    ///
    /// `results` must answer `calls` in the same order.
    pub fn push_tool_exchange(&mut self, calls: Vec<ToolCall>, results: Vec<ToolResult>) {
        debug_assert_eq!(calls.len(), results.len());
        self.push(Turn::ToolCalls { calls });
        self.turns.extend(results.into_iter().map(Turn::ToolResult));
    }

    /// Get all turns
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Get the last turn
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Last assistant text, if any
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|turn| match turn {
            Turn::AssistantText { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Call IDs that have no matching result turn
    pub fn unresolved_calls(&self) -> Vec<&str> {
        let mut open: Vec<&str> = Vec::new();
        for turn in &self.turns {
            match turn {
                Turn::ToolCalls { calls } => open.extend(calls.iter().map(|c| c.id.as_str())),
                Turn::ToolResult(result) => open.retain(|id| *id != result.call_id),
                _ => {}
            }
        }
        open
    }

    /// Clear all turns, keeping the system prompt
    pub fn clear_history(&mut self) {
        self.turns.clear();
    }

    /// Number of turns
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation() {
        let mut conv = ConversationState::with_system_prompt("You are helpful.");
        conv.push_user("Hi");
        conv.push(Turn::assistant("Hello!"));

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.system_prompt.as_deref(), Some("You are helpful."));
        assert_eq!(conv.last_assistant_text(), Some("Hello!"));
    }

    #[test]
    fn test_tool_exchange_resolves_calls() {
        let mut conv = ConversationState::new();
        conv.push_user("fetch two pages");
        let calls = vec![
            ToolCall::new("a", "fetch__fetch", json!({"url": "https://a"})),
            ToolCall::new("b", "fetch__fetch", json!({"url": "https://b"})),
        ];
        let results = calls.iter().map(|c| ToolResult::success(c, "ok")).collect();
        conv.push_tool_exchange(calls.clone(), results);

        assert!(conv.unresolved_calls().is_empty());
        assert_eq!(conv.len(), 4);

        conv.push(Turn::ToolCalls { calls });
        assert_eq!(conv.unresolved_calls(), vec!["a", "b"]);
    }

    #[test]
    fn test_turn_serialization_is_tagged() {
        let value = serde_json::to_value(Turn::user("hi")).unwrap();
        assert_eq!(value, json!({"kind": "user", "content": "hi"}));
    }
}
