// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    provider::{ProviderStream, StreamOptions},
    FinishReason, ImageSource, Message, ProviderEvent, Role, TokenUsage, ToolInvocation,
};

/// Streaming adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        messages: &[Message],
        opts: StreamOptions,
    ) -> anyhow::Result<ProviderStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;

        let (hoisted_system, wire_messages) = build_anthropic_messages(messages);

        let mut body = json!({
            "model": opts.model,
            "messages": wire_messages,
            "max_tokens": opts.max_tokens.unwrap_or(4096),
            "stream": true,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        let system = opts.system.clone().or(hoisted_system);
        if let Some(s) = system.filter(|s| !s.is_empty()) {
            body["system"] = json!(s);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        // SSE lines can be split across TCP chunks, so the line buffer is
        // carried forward in the scan state; only complete lines are parsed.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                state.line_buf.push_str(&text);
                let mut events: Vec<anyhow::Result<ProviderEvent>> = Vec::new();
                while let Some(pos) = state.line_buf.find('\n') {
                    let line = state.line_buf[..pos].trim_end_matches('\r').to_string();
                    state.line_buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.extend(apply_anthropic_event(state, &v).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(crate::provider::end_on_cancel(
            event_stream,
            opts.cancel.clone(),
        ))
    }
}

/// Accumulation state carried across SSE chunks.
#[derive(Default)]
struct SseState {
    line_buf: String,
    open_tool: Option<PendingInvocation>,
    tool_calls: Vec<ToolInvocation>,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

struct PendingInvocation {
    id: String,
    name: String,
    input: String,
}

/// Fold one parsed SSE payload into the stream state, returning the provider
/// events it produces (possibly none: pings, signature deltas, block stops
/// for text blocks).
fn apply_anthropic_event(state: &mut SseState, v: &Value) -> Vec<ProviderEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                state.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                if let Some(n) = usage["cache_read_input_tokens"].as_u64() {
                    state.usage.cache_read_tokens = Some(n);
                }
                if let Some(n) = usage["cache_creation_input_tokens"].as_u64() {
                    state.usage.cache_creation_tokens = Some(n);
                }
            }
            vec![]
        }
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                state.open_tool = Some(PendingInvocation {
                    id: id.clone(),
                    name: name.clone(),
                    input: String::new(),
                });
                vec![ProviderEvent::ToolUseStart { id, name }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    vec![ProviderEvent::ContentDelta(text)]
                }
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("").to_string();
                    vec![ProviderEvent::ThinkingDelta(thinking)]
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    match state.open_tool.as_mut() {
                        Some(tool) => {
                            tool.input.push_str(&partial);
                            vec![ProviderEvent::ToolUseDelta(partial)]
                        }
                        None => {
                            warn!("input_json_delta with no open tool_use block");
                            vec![]
                        }
                    }
                }
                // signature_delta is an integrity blob, never surfaced.
                _ => vec![],
            }
        }
        "content_block_stop" => match state.open_tool.take() {
            Some(tool) => {
                state.tool_calls.push(ToolInvocation {
                    id: tool.id,
                    name: tool.name,
                    input: tool.input,
                });
                vec![ProviderEvent::ToolUseStop]
            }
            None => vec![],
        },
        "message_delta" => {
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                state.stop_reason = Some(reason.to_string());
            }
            if let Some(usage) = v.get("usage") {
                state.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
            }
            vec![]
        }
        "message_stop" => {
            let reason = state
                .stop_reason
                .as_deref()
                .map(FinishReason::from_wire)
                .unwrap_or(FinishReason::EndTurn);
            vec![ProviderEvent::Complete {
                finish_reason: reason,
                tool_calls: std::mem::take(&mut state.tool_calls),
                usage: state.usage,
            }]
        }
        "error" => {
            let msg = v["error"]["message"]
                .as_str()
                .unwrap_or("unknown Anthropic stream error")
                .to_string();
            vec![ProviderEvent::Error(msg)]
        }
        // "ping" and anything unrecognized
        _ => vec![],
    }
}

/// Convert internal messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`.  Any system message is
/// hoisted out because Anthropic expects it as a top-level `system` field,
/// not as a conversation turn.  Tool messages become user turns holding
/// `tool_result` blocks keyed by invocation id.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_text: Option<String> = None;
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                system_text = Some(m.content.clone());
            }
            Role::User => {
                if m.images.is_empty() {
                    out.push(json!({ "role": "user", "content": m.content }));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        content.push(json!({ "type": "text", "text": m.content }));
                    }
                    for img in &m.images {
                        content.push(image_block(img));
                    }
                    out.push(json!({ "role": "user", "content": content }));
                }
            }
            Role::Assistant => {
                if m.tool_calls.is_empty() {
                    out.push(json!({ "role": "assistant", "content": m.content }));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        content.push(json!({ "type": "text", "text": m.content }));
                    }
                    for tc in &m.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": serde_json::from_str::<Value>(&tc.input)
                                .unwrap_or(json!({})),
                        }));
                    }
                    out.push(json!({ "role": "assistant", "content": content }));
                }
            }
            Role::Tool => {
                let blocks: Vec<Value> = m
                    .tool_results
                    .iter()
                    .map(|r| {
                        let mut block = json!({
                            "type": "tool_result",
                            "tool_use_id": r.invocation_id,
                            "content": r.content,
                        });
                        if r.is_error {
                            block["is_error"] = json!(true);
                        }
                        block
                    })
                    .collect();
                out.push(json!({ "role": "user", "content": blocks }));
            }
        }
    }
    (system_text, out)
}

fn image_block(img: &ImageSource) -> Value {
    match img {
        ImageSource::Base64 { media_type, data } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": data,
            }
        }),
        ImageSource::Url { url } => json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
