// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::{
    provider::{ProviderStream, StreamOptions},
    FinishReason, ImageSource, Message, ProviderEvent, Role, TokenUsage, ToolInvocation,
};

/// Streaming adapter for OpenAI-style chat-completions endpoints.
pub struct OpenAiProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| "https://api.openai.com/v1".into());
        Self {
            api_key,
            base_url: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        messages: &[Message],
        opts: StreamOptions,
    ) -> anyhow::Result<ProviderStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;

        let mut wire_messages = Vec::new();
        if let Some(system) = opts.system.as_deref().filter(|s| !s.is_empty()) {
            wire_messages.push(json!({ "role": "system", "content": system }));
        }
        wire_messages.extend(build_openai_messages(messages));

        let mut body = json!({
            "model": opts.model,
            "messages": wire_messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(n) = opts.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let events: Vec<anyhow::Result<ProviderEvent>> = match chunk {
                    Ok(b) => {
                        state.line_buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(state)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(crate::provider::end_on_cancel(
            event_stream,
            opts.cancel.clone(),
        ))
    }
}

/// Accumulation state carried across SSE chunks.
///
/// OpenAI keys parallel tool-call deltas by `index`; a change of index means
/// the previous invocation is complete, so the fold can re-frame the wire
/// events as start/delta/stop without buffering whole invocations for the
/// common single-call case.
#[derive(Default)]
struct SseState {
    line_buf: String,
    open_tool: Option<OpenInvocation>,
    tool_calls: Vec<ToolInvocation>,
    usage: TokenUsage,
    finish_reason: Option<String>,
    completed: bool,
}

struct OpenInvocation {
    index: u64,
    id: String,
    name: String,
    input: String,
}

/// Drain all complete `\n`-terminated SSE lines from the state's buffer.
///
/// A single SSE event may be split across multiple TCP packets; any trailing
/// incomplete line is left in the buffer for the next chunk.
fn drain_complete_sse_lines(state: &mut SseState) -> Vec<anyhow::Result<ProviderEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = state.line_buf.find('\n') {
        let line = state.line_buf[..nl_pos].trim_end_matches('\r').to_string();
        state.line_buf.drain(..=nl_pos);
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            events.extend(finalize(state).into_iter().map(Ok));
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(data) {
            events.extend(apply_openai_chunk(state, &v).into_iter().map(Ok));
        }
    }
    events
}

fn close_open_tool(state: &mut SseState) -> Option<ProviderEvent> {
    state.open_tool.take().map(|t| {
        state.tool_calls.push(ToolInvocation {
            id: t.id,
            name: t.name,
            input: t.input,
        });
        ProviderEvent::ToolUseStop
    })
}

/// Emit the terminal `Complete` once, on the `[DONE]` sentinel.
fn finalize(state: &mut SseState) -> Vec<ProviderEvent> {
    if state.completed {
        return vec![];
    }
    state.completed = true;
    let mut events = Vec::new();
    if let Some(stop) = close_open_tool(state) {
        events.push(stop);
    }
    let reason = state
        .finish_reason
        .as_deref()
        .map(FinishReason::from_wire)
        .unwrap_or(FinishReason::EndTurn);
    events.push(ProviderEvent::Complete {
        finish_reason: reason,
        tool_calls: std::mem::take(&mut state.tool_calls),
        usage: state.usage,
    });
    events
}

fn apply_openai_chunk(state: &mut SseState, v: &Value) -> Vec<ProviderEvent> {
    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        state.usage.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
        state.usage.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
        if let Some(cached) = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
        {
            state.usage.cache_read_tokens = Some(cached);
        }
        return vec![];
    }

    let choice = &v["choices"][0];
    if let Some(reason) = choice["finish_reason"].as_str() {
        state.finish_reason = Some(reason.to_string());
    }

    let delta = &choice["delta"];
    let mut events = Vec::new();

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0);
            let is_new = state.open_tool.as_ref().map(|t| t.index) != Some(index);
            if is_new {
                if let Some(stop) = close_open_tool(state) {
                    events.push(stop);
                }
                let id = tc["id"].as_str().unwrap_or("").to_string();
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                state.open_tool = Some(OpenInvocation {
                    index,
                    id: id.clone(),
                    name: name.clone(),
                    input: String::new(),
                });
                events.push(ProviderEvent::ToolUseStart { id, name });
            }
            let args = tc["function"]["arguments"].as_str().unwrap_or("");
            if !args.is_empty() {
                if let Some(open) = state.open_tool.as_mut() {
                    open.input.push_str(args);
                }
                events.push(ProviderEvent::ToolUseDelta(args.to_string()));
            }
        }
        return events;
    }

    // Chain-of-thought text; `reasoning_content` is the common field name,
    // `reasoning` the aggregator variant.
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking.filter(|t| !t.is_empty()) {
        events.push(ProviderEvent::ThinkingDelta(t.to_string()));
        return events;
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(ProviderEvent::ContentDelta(text.to_string()));
        }
    }
    events
}

/// Convert internal messages into the OpenAI wire-format JSON array.
///
/// Tool messages expand to one wire message per outcome bearing
/// `tool_call_id`; assistant invocations become the `tool_calls[].function`
/// shape; images become `image_url` content parts.
pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::System => out.push(json!({ "role": "system", "content": m.content })),
            Role::User => {
                if m.images.is_empty() {
                    out.push(json!({ "role": "user", "content": m.content }));
                } else {
                    let mut parts: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        parts.push(json!({ "type": "text", "text": m.content }));
                    }
                    for img in &m.images {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": { "url": image_url(img) },
                        }));
                    }
                    out.push(json!({ "role": "user", "content": parts }));
                }
            }
            Role::Assistant => {
                if m.tool_calls.is_empty() {
                    out.push(json!({ "role": "assistant", "content": m.content }));
                } else {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.input },
                            })
                        })
                        .collect();
                    let content = if m.content.is_empty() {
                        Value::Null
                    } else {
                        json!(m.content)
                    };
                    out.push(json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": calls,
                    }));
                }
            }
            Role::Tool => {
                for r in &m.tool_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": r.invocation_id,
                        "content": r.content,
                    }));
                }
            }
        }
    }
    out
}

fn image_url(img: &ImageSource) -> String {
    match img {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolOutcome;

    fn drain(state: &mut SseState, lines: &[&str]) -> Vec<ProviderEvent> {
        for line in lines {
            state.line_buf.push_str(line);
            state.line_buf.push('\n');
        }
        drain_complete_sse_lines(state)
            .into_iter()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn tool_message_expands_to_one_wire_message_per_outcome() {
        let msg = Message::tool(
            "a\n\nb",
            vec![ToolOutcome::ok("tc1", "a"), ToolOutcome::ok("tc2", "b")],
        );
        let wire = build_openai_messages(&[msg]);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "tc1");
        assert_eq!(wire[1]["tool_call_id"], "tc2");
        assert_eq!(wire[1]["content"], "b");
    }

    #[test]
    fn assistant_invocations_use_function_shape() {
        let msg = Message::assistant_turn(
            "",
            vec![ToolInvocation {
                id: "tc1".into(),
                name: "echo".into(),
                input: r#"{"text":"hi"}"#.into(),
            }],
            "m",
            None,
        );
        let wire = build_openai_messages(&[msg]);
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["type"], "function");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(
            wire[0]["tool_calls"][0]["function"]["arguments"],
            r#"{"text":"hi"}"#
        );
    }

    #[test]
    fn base64_image_becomes_data_url_part() {
        let msg = Message::user_with_images(
            "look",
            vec![ImageSource::Base64 {
                media_type: "image/jpeg".into(),
                data: "QUJD".into(),
            }],
        );
        let wire = build_openai_messages(&[msg]);
        assert_eq!(
            wire[0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn text_deltas_and_done_produce_content_then_complete() {
        let mut state = SseState::default();
        let events = drain(
            &mut state,
            &[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":20}}"#,
                "data: [DONE]",
            ],
        );
        assert!(matches!(&events[0], ProviderEvent::ContentDelta(t) if t == "Hel"));
        assert!(matches!(&events[1], ProviderEvent::ContentDelta(t) if t == "lo"));
        match events.last().unwrap() {
            ProviderEvent::Complete {
                finish_reason,
                usage,
                ..
            } => {
                assert_eq!(*finish_reason, FinishReason::EndTurn);
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 20);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_deltas_reframe_as_start_delta_stop() {
        let mut state = SseState::default();
        let events = drain(
            &mut state,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc1","function":{"name":"echo","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"text\":\"hi\"}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        assert!(
            matches!(&events[0], ProviderEvent::ToolUseStart { id, name } if id == "tc1" && name == "echo")
        );
        assert!(matches!(&events[1], ProviderEvent::ToolUseDelta(a) if a.contains("hi")));
        assert!(matches!(events[2], ProviderEvent::ToolUseStop));
        match &events[3] {
            ProviderEvent::Complete {
                finish_reason,
                tool_calls,
                ..
            } => {
                assert_eq!(*finish_reason, FinishReason::ToolUse);
                assert_eq!(tool_calls[0].input, r#"{"text":"hi"}"#);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn parallel_tool_calls_close_previous_index() {
        let mut state = SseState::default();
        let events = drain(
            &mut state,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"one","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"two","arguments":"{}"}}]}}]}"#,
                "data: [DONE]",
            ],
        );
        let stops = events
            .iter()
            .filter(|e| matches!(e, ProviderEvent::ToolUseStop))
            .count();
        assert_eq!(stops, 2);
        match events.last().unwrap() {
            ProviderEvent::Complete { tool_calls, .. } => {
                let names: Vec<&str> = tool_calls.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["one", "two"]);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn split_sse_line_is_buffered_until_complete() {
        let mut state = SseState::default();
        state
            .line_buf
            .push_str(r#"data: {"choices":[{"delta":{"con"#);
        assert!(drain_complete_sse_lines(&mut state).is_empty());
        let events = drain(&mut state, &[r#"tent":"hi"}}]}"#]);
        assert!(matches!(&events[0], ProviderEvent::ContentDelta(t) if t == "hi"));
    }

    #[test]
    fn reasoning_content_surfaces_as_thinking() {
        let mut state = SseState::default();
        let events = drain(
            &mut state,
            &[r#"data: {"choices":[{"delta":{"reasoning_content":"pondering"}}]}"#],
        );
        assert!(matches!(&events[0], ProviderEvent::ThinkingDelta(t) if t == "pondering"));
    }

    #[test]
    fn length_finish_reason_maps_to_max_tokens() {
        let mut state = SseState::default();
        let events = drain(
            &mut state,
            &[
                r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#,
                "data: [DONE]",
            ],
        );
        assert!(matches!(
            events.last().unwrap(),
            ProviderEvent::Complete {
                finish_reason: FinishReason::MaxTokens,
                ..
            }
        ));
    }
}
