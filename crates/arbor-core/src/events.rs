// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use arbor_model::{FinishReason, Message, TokenUsage, ToolInvocation, ToolOutcome};
use serde::{Deserialize, Serialize};

/// Events emitted by an agent during one run.
///
/// Every run ends with exactly one `Done`, including the error and
/// cancellation paths.  Serde-tagged so the workflow event plane can carry
/// these as JSON payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial internal reasoning streamed from the model.
    Thinking { text: String },
    /// Partial user-visible text streamed from the model.
    Content { text: String },
    /// The model finalized a tool invocation.
    ToolCall { invocation: ToolInvocation },
    /// One executed invocation's outcome.
    ToolResult { outcome: ToolOutcome },
    /// A complete message was appended to the session.
    Message { message: Message },
    /// Terminal event; exactly one per run.  `usage` is the run's
    /// cumulative usage, summed over every turn.
    Done {
        reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    /// A recoverable-at-the-caller failure; followed by `Done`.
    Error { message: String },
}

impl AgentEvent {
    /// Wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Content { .. } => "content",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Message { .. } => "message",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Token usage carried by this event.  Only `Done` events carry usage
    /// at the event level, and that usage is cumulative over the run's
    /// turns, so aggregators sum exactly one number per run.  The per-turn
    /// usage on a `Message` payload belongs to the message itself and is
    /// never counted again.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Done { usage, .. } => *usage,
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tag_matches_kind() {
        let ev = AgentEvent::Content { text: "hi".into() };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], ev.kind());
        assert_eq!(v["text"], "hi");
    }

    #[test]
    fn done_round_trips_with_usage() {
        let ev = AgentEvent::Done {
            reason: FinishReason::EndTurn,
            usage: Some(TokenUsage::new(10, 20)),
        };
        let v = serde_json::to_value(&ev).unwrap();
        let back: AgentEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back.usage(), Some(TokenUsage::new(10, 20)));
        assert!(back.is_done());
    }

    #[test]
    fn only_done_events_carry_usage() {
        let mut msg = Message::assistant("x");
        msg.usage = Some(TokenUsage::new(1, 2));
        assert_eq!(AgentEvent::Message { message: msg }.usage(), None);
        assert_eq!(AgentEvent::Content { text: "x".into() }.usage(), None);
    }
}
