// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{ProviderStream, StreamOptions},
    FinishReason, Message, ProviderEvent, TokenUsage, ToolInvocation,
};

/// A pre-scripted provider for tests.  Each `stream` call pops the next
/// event script from the front of the queue, so tests can specify exact
/// event sequences, including tool invocations, without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    name: String,
    /// The last `StreamOptions` seen by this provider, written on each
    /// `stream()` call so tests can inspect what was sent.
    pub last_options: Arc<Mutex<Option<StreamOptions>>>,
    /// The messages sent with the most recent `stream()` call.
    pub last_messages: Arc<Mutex<Vec<Message>>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted".into(),
            last_options: Arc::new(Mutex::new(None)),
            last_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Convenience: provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ProviderEvent::ContentDelta(r),
            ProviderEvent::Complete {
                finish_reason: FinishReason::EndTurn,
                tool_calls: vec![],
                usage: TokenUsage::new(5, 5),
            },
        ]])
    }

    /// Convenience: one tool round followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        let name = tool_name.into();
        let args = args_json.into();
        Self::new(vec![
            // Round 1 – the model streams one tool invocation.
            vec![
                ProviderEvent::ToolUseStart {
                    id: id.clone(),
                    name: name.clone(),
                },
                ProviderEvent::ToolUseDelta(args.clone()),
                ProviderEvent::ToolUseStop,
                ProviderEvent::Complete {
                    finish_reason: FinishReason::ToolUse,
                    tool_calls: vec![ToolInvocation {
                        id,
                        name,
                        input: args,
                    }],
                    usage: TokenUsage::new(10, 20),
                },
            ],
            // Round 2 – the model answers after seeing the tool result.
            vec![
                ProviderEvent::ContentDelta(final_text.into()),
                ProviderEvent::Complete {
                    finish_reason: FinishReason::EndTurn,
                    tool_calls: vec![],
                    usage: TokenUsage::new(5, 5),
                },
            ],
        ])
    }
}

#[async_trait]
impl crate::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        messages: &[Message],
        opts: StreamOptions,
    ) -> anyhow::Result<ProviderStream> {
        *self.last_messages.lock().unwrap() = messages.to_vec();
        *self.last_options.lock().unwrap() = Some(opts);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback after all scripts are consumed.
                vec![
                    ProviderEvent::ContentDelta("[no more scripts]".into()),
                    ProviderEvent::Complete {
                        finish_reason: FinishReason::EndTurn,
                        tool_calls: vec![],
                        usage: TokenUsage::default(),
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Provider;

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let p = ScriptedProvider::always_text("hello world");
        let mut stream = p
            .stream(&[Message::user("hi")], StreamOptions::default())
            .await
            .unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ProviderEvent::ContentDelta(t) if t == "hello world"));
    }

    #[tokio::test]
    async fn tool_then_text_scripts_two_calls() {
        let p = ScriptedProvider::tool_then_text("tc1", "echo", r#"{"text":"hi"}"#, "done");

        let mut first = Vec::new();
        let mut stream = p
            .stream(&[Message::user("go")], StreamOptions::default())
            .await
            .unwrap();
        while let Some(ev) = stream.next().await {
            first.push(ev.unwrap());
        }
        assert!(first
            .iter()
            .any(|e| matches!(e, ProviderEvent::ToolUseStart { name, .. } if name == "echo")));

        let mut second = Vec::new();
        let mut stream = p
            .stream(&[Message::user("go")], StreamOptions::default())
            .await
            .unwrap();
        while let Some(ev) = stream.next().await {
            second.push(ev.unwrap());
        }
        assert!(second
            .iter()
            .any(|e| matches!(e, ProviderEvent::ContentDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn fallback_after_scripts_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let mut stream = p
            .stream(&[Message::user("hi")], StreamOptions::default())
            .await
            .unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ProviderEvent::ContentDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn last_options_captures_the_request() {
        let p = ScriptedProvider::always_text("ok");
        let opts = StreamOptions {
            model: "test-model".into(),
            ..Default::default()
        };
        let _ = p.stream(&[Message::user("hi")], opts).await.unwrap();
        let seen = p.last_options.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().model, "test-model");
    }
}
