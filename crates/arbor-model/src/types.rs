// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a short, URL-safe, opaque identifier.
///
/// Twelve hex characters from a v4 UUID: enough entropy for in-process
/// run/agent/message ids, short enough to read in logs.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An image attached to a user message.
///
/// Either inline base64 with its mime type, or a remote URL for providers
/// that accept references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 {
        /// `image/png`, `image/jpeg`, `image/gif`, or `image/webp`.
        media_type: String,
        data: String,
    },
    Url {
        url: String,
    },
}

/// A tool invocation requested by the model.
///
/// `input` is the full JSON serialization of the arguments, accumulated
/// from every `tool_use_delta` between a `tool_use_start` and its matching
/// `tool_use_stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: String,
}

/// The outcome of executing one tool invocation.
///
/// Every invocation in an assistant message produces exactly one outcome,
/// including the synthetic "Unknown tool" and "Canceled" ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub invocation_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutcome {
    pub fn ok(invocation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn error(invocation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            content: content.into(),
            is_error: true,
            metadata: None,
        }
    }
}

/// Token accounting for one model turn.  A monoid under [`TokenUsage::add`];
/// `Default` is the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_read_tokens: None,
            cache_creation_tokens: None,
        }
    }

    /// Componentwise addition.  `None` counters act as zero; the sum keeps
    /// `None` only when both sides are `None`.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens = sum_opt(self.cache_read_tokens, other.cache_read_tokens);
        self.cache_creation_tokens =
            sum_opt(self.cache_creation_tokens, other.cache_creation_tokens);
    }
}

fn sum_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

/// Why a model turn (or a run) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Stop,
    Canceled,
    Error,
}

impl FinishReason {
    /// Map a provider finish-reason string onto the internal enum.
    ///
    /// `stop`/`end_turn` → `EndTurn`, `tool_calls`/`tool_use` → `ToolUse`,
    /// `length`/`max_tokens` → `MaxTokens`; anything unrecognized is treated
    /// as a normal end of turn.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" | "end_turn" => Self::EndTurn,
            "tool_calls" | "tool_use" => Self::ToolUse,
            "length" | "max_tokens" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Stop => "stop",
            Self::Canceled => "canceled",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A single message in the conversation history.  Immutable once appended
/// to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            model: None,
            timestamp: Utc::now(),
            usage: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageSource>) -> Self {
        let mut m = Self::base(Role::User, content);
        m.images = images;
        m
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// Assistant turn as assembled by the loop: streamed text plus any tool
    /// invocations, stamped with the model that produced it.
    pub fn assistant_turn(
        content: impl Into<String>,
        tool_calls: Vec<ToolInvocation>,
        model: impl Into<String>,
        usage: Option<TokenUsage>,
    ) -> Self {
        let mut m = Self::base(Role::Assistant, content);
        m.tool_calls = tool_calls;
        m.model = Some(model.into());
        m.usage = usage;
        m
    }

    /// Tool message carrying the outcomes of one batch of invocations.
    pub fn tool(content: impl Into<String>, tool_results: Vec<ToolOutcome>) -> Self {
        let mut m = Self::base(Role::Tool, content);
        m.tool_results = tool_results;
        m
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_url_safe_and_distinct() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn message_user_sets_role_and_content() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn assistant_turn_carries_calls_model_and_usage() {
        let m = Message::assistant_turn(
            "text",
            vec![ToolInvocation {
                id: "tc1".into(),
                name: "echo".into(),
                input: "{}".into(),
            }],
            "test-model",
            Some(TokenUsage::new(10, 20)),
        );
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.model.as_deref(), Some("test-model"));
        assert_eq!(m.usage.unwrap().output_tokens, 20);
    }

    #[test]
    fn tool_message_carries_outcomes() {
        let m = Message::tool("out", vec![ToolOutcome::ok("tc1", "out")]);
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_results[0].invocation_id, "tc1");
        assert!(!m.tool_results[0].is_error);
    }

    #[test]
    fn usage_add_is_componentwise() {
        let mut a = TokenUsage::new(10, 20);
        a.add(&TokenUsage::new(1, 2));
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 22);
        assert_eq!(a.cache_read_tokens, None);
    }

    #[test]
    fn usage_add_treats_none_counters_as_zero() {
        let mut a = TokenUsage {
            cache_read_tokens: Some(5),
            ..TokenUsage::new(0, 0)
        };
        a.add(&TokenUsage::new(0, 0));
        assert_eq!(a.cache_read_tokens, Some(5));
        a.add(&TokenUsage {
            cache_read_tokens: Some(7),
            ..Default::default()
        });
        assert_eq!(a.cache_read_tokens, Some(12));
    }

    #[test]
    fn usage_default_is_additive_identity() {
        let mut a = TokenUsage::new(3, 4);
        let before = a;
        a.add(&TokenUsage::default());
        assert_eq!(a, before);
    }

    #[test]
    fn finish_reason_wire_mapping() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::EndTurn);
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::EndTurn);
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_wire("tool_use"), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_wire("length"), FinishReason::MaxTokens);
        assert_eq!(
            FinishReason::from_wire("max_tokens"),
            FinishReason::MaxTokens
        );
        assert_eq!(FinishReason::from_wire("whatever"), FinishReason::EndTurn);
    }

    #[test]
    fn message_serializes_and_deserializes() {
        let original = Message::user_with_images(
            "look",
            vec![ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "QUJD".into(),
            }],
        );
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.images, original.images);
    }

    #[test]
    fn empty_collections_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("images"));
        assert!(!json.contains("usage"));
    }
}
