// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arbor_model::{
    FinishReason, ImageSource, Message, Provider, ProviderEvent, StreamOptions, TokenUsage,
    ToolInvocation, ToolOutcome,
};
use arbor_tools::{Tool, ToolContext, ToolRegistry, ToolResult};

use crate::{events::AgentEvent, session::Session};

/// Synchronous event tap; panics are swallowed so an observer can never
/// break the loop.
pub type EventObserver = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Static configuration for one agent.
#[derive(Clone)]
pub struct AgentConfig {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: ToolRegistry,
    pub max_turns: u32,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub working_dir: Option<PathBuf>,
    pub observer: Option<EventObserver>,
}

impl AgentConfig {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            system_prompt: None,
            tools: ToolRegistry::new(),
            max_turns: 50,
            max_tokens: None,
            temperature: None,
            working_dir: None,
            observer: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Per-run inputs.
#[derive(Default)]
pub struct RunOptions {
    pub images: Vec<ImageSource>,
    /// External cancellation; the run links an internal child token to it.
    pub cancel: Option<CancellationToken>,
    /// Session to continue; a fresh one is created when absent.
    pub session: Option<Session>,
    pub observer: Option<EventObserver>,
}

/// Lazy, single-consumer sequence of [`AgentEvent`]s for one run.
///
/// Dropping the stream cancels the producing task, so a consumer's early
/// exit tears the run down instead of leaking it.
pub struct EventStream {
    rx: mpsc::Receiver<AgentEvent>,
    session: Session,
    cancel_on_drop: CancellationToken,
}

impl EventStream {
    /// The session this run is appending to.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AgentEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel_on_drop.cancel();
    }
}

struct Emitter {
    tx: mpsc::Sender<AgentEvent>,
    observers: Vec<EventObserver>,
}

impl Emitter {
    /// Deliver to observers synchronously (panics swallowed), then to the
    /// stream.  A gone consumer is not an error: drop-cancellation ends the
    /// loop at its next check.
    async fn emit(&self, event: AgentEvent) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                warn!("agent event observer panicked; ignoring");
            }
        }
        let _ = self.tx.send(event).await;
    }
}

/// What one provider stream produced.
#[derive(Default)]
struct TurnAccumulator {
    content: String,
    tool_calls: Vec<ToolInvocation>,
    pending: Option<PendingInvocation>,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

struct PendingInvocation {
    id: String,
    name: String,
    input: String,
}

/// A configured unit that drives the streaming turn loop against a provider
/// and tool set.  Cheap to clone; clones share the active-run table.
#[derive(Clone)]
pub struct Agent {
    config: AgentConfig,
    /// Internal cancellation tokens of in-flight runs, keyed by session id.
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start a run: append the user message and spawn the turn loop.  The
    /// returned stream yields events as they happen and ends after the
    /// single terminal `Done`.
    pub fn run(&self, prompt: impl Into<String>, opts: RunOptions) -> EventStream {
        let RunOptions {
            images,
            cancel,
            session,
            observer,
        } = opts;
        let session = session.unwrap_or_default();
        let internal = cancel.map(|c| c.child_token()).unwrap_or_default();
        self.active
            .lock()
            .unwrap()
            .insert(session.id().to_string(), internal.clone());

        let mut observers = Vec::new();
        if let Some(o) = &self.config.observer {
            observers.push(Arc::clone(o));
        }
        if let Some(o) = observer {
            observers.push(o);
        }

        session.add_message(Message::user_with_images(prompt, images));

        let (tx, rx) = mpsc::channel(64);
        let agent = self.clone();
        let run_session = session.clone();
        let token = internal.clone();
        tokio::spawn(async move {
            let emitter = Emitter { tx, observers };
            agent.drive(&run_session, &token, &emitter).await;
            agent.active.lock().unwrap().remove(run_session.id());
        });

        EventStream {
            rx,
            session,
            cancel_on_drop: internal,
        }
    }

    /// Cancel the run currently attached to `session_id`, if any.
    pub fn cancel(&self, session_id: &str) {
        if let Some(token) = self.active.lock().unwrap().get(session_id) {
            debug!(session_id, "cancelling run");
            token.cancel();
        }
    }

    /// Expose this agent as a tool with input schema `{ prompt: string }`.
    /// Executing it runs the agent on a fresh session with the caller's
    /// cancellation token and returns the final assistant reply.
    pub fn as_tool(
        &self,
        name: Option<String>,
        description: Option<String>,
    ) -> Arc<dyn Tool> {
        Arc::new(AgentTool {
            name: name.unwrap_or_else(|| self.config.name.clone()),
            description: description.unwrap_or_else(|| {
                format!(
                    "Run the {} agent on a task and return its final reply.",
                    self.config.name
                )
            }),
            agent: self.clone(),
        })
    }

    /// One whole run: stream → reconstruct → tools → re-stream, until a
    /// terminal condition.
    async fn drive(&self, session: &Session, cancel: &CancellationToken, emitter: &Emitter) {
        // Run-level usage: every turn's `complete` usage summed, carried by
        // the terminal `done` so aggregators read one number per run.
        let mut run_usage: Option<TokenUsage> = None;
        for _ in 0..self.config.max_turns {
            if cancel.is_cancelled() {
                emitter
                    .emit(AgentEvent::Done {
                        reason: FinishReason::Canceled,
                        usage: run_usage,
                    })
                    .await;
                return;
            }

            let options = StreamOptions {
                model: self.config.model.clone(),
                system: self.config.system_prompt.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                tools: self.config.tools.schemas(),
                cancel: cancel.clone(),
            };
            let messages = session.messages();
            let mut stream = match self.config.provider.stream(&messages, options).await {
                Ok(s) => s,
                Err(e) => {
                    self.finish_with_provider_failure(cancel, emitter, e.to_string(), run_usage)
                        .await;
                    return;
                }
            };

            let mut acc = TurnAccumulator::default();
            loop {
                // Biased toward cancellation so a hung provider cannot keep
                // the run alive; providers also end their stream when the
                // token fires.
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    if cancel.is_cancelled() {
                        emitter
                            .emit(AgentEvent::Done {
                                reason: FinishReason::Canceled,
                                usage: run_usage,
                            })
                            .await;
                        return;
                    }
                    break;
                };
                match item {
                    Err(e) => {
                        self.save_partial(session, &acc);
                        self.finish_with_provider_failure(
                            cancel,
                            emitter,
                            e.to_string(),
                            run_usage,
                        )
                        .await;
                        return;
                    }
                    Ok(ProviderEvent::ThinkingDelta(text)) => {
                        emitter.emit(AgentEvent::Thinking { text }).await;
                    }
                    Ok(ProviderEvent::ContentDelta(text)) => {
                        acc.content.push_str(&text);
                        emitter.emit(AgentEvent::Content { text }).await;
                    }
                    Ok(ProviderEvent::ToolUseStart { id, name }) => {
                        acc.pending = Some(PendingInvocation {
                            id,
                            name,
                            input: String::new(),
                        });
                    }
                    Ok(ProviderEvent::ToolUseDelta(fragment)) => {
                        if let Some(pending) = acc.pending.as_mut() {
                            pending.input.push_str(&fragment);
                        } else {
                            warn!("tool_use_delta with no open invocation; dropping");
                        }
                    }
                    Ok(ProviderEvent::ToolUseStop) => {
                        if let Some(pending) = acc.pending.take() {
                            let invocation = ToolInvocation {
                                id: pending.id,
                                name: pending.name,
                                input: pending.input,
                            };
                            emitter
                                .emit(AgentEvent::ToolCall {
                                    invocation: invocation.clone(),
                                })
                                .await;
                            acc.tool_calls.push(invocation);
                        }
                    }
                    Ok(ProviderEvent::Complete {
                        finish_reason,
                        tool_calls,
                        usage,
                    }) => {
                        acc.finish = Some(finish_reason);
                        acc.usage = Some(usage);
                        run_usage.get_or_insert_with(TokenUsage::default).add(&usage);
                        // Invocations present only in the complete payload
                        // (not seen via the delta path) are merged, deduped
                        // by id.
                        for invocation in tool_calls {
                            if acc.tool_calls.iter().any(|t| t.id == invocation.id) {
                                continue;
                            }
                            emitter
                                .emit(AgentEvent::ToolCall {
                                    invocation: invocation.clone(),
                                })
                                .await;
                            acc.tool_calls.push(invocation);
                        }
                        break;
                    }
                    Ok(ProviderEvent::Error(message)) => {
                        self.save_partial(session, &acc);
                        self.finish_with_provider_failure(cancel, emitter, message, run_usage)
                            .await;
                        return;
                    }
                }
            }

            let message = Message::assistant_turn(
                std::mem::take(&mut acc.content),
                acc.tool_calls.clone(),
                &self.config.model,
                acc.usage,
            );
            session.add_message(message.clone());
            emitter.emit(AgentEvent::Message { message }).await;

            if acc.tool_calls.is_empty() || acc.finish != Some(FinishReason::ToolUse) {
                emitter
                    .emit(AgentEvent::Done {
                        reason: acc.finish.unwrap_or(FinishReason::EndTurn),
                        usage: run_usage,
                    })
                    .await;
                return;
            }

            // Invocations execute sequentially, in source order.
            let mut outcomes = Vec::with_capacity(acc.tool_calls.len());
            for invocation in &acc.tool_calls {
                outcomes.push(self.execute_invocation(session, cancel, invocation).await);
            }

            let joined = outcomes
                .iter()
                .map(|o| o.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            session.add_message(Message::tool(joined, outcomes.clone()));
            for outcome in outcomes {
                emitter.emit(AgentEvent::ToolResult { outcome }).await;
            }
        }

        emitter
            .emit(AgentEvent::Done {
                reason: FinishReason::MaxTokens,
                usage: run_usage,
            })
            .await;
    }

    async fn execute_invocation(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        invocation: &ToolInvocation,
    ) -> ToolOutcome {
        if cancel.is_cancelled() {
            return ToolOutcome::error(&invocation.id, "Canceled");
        }
        let Some(tool) = self.config.tools.get(&invocation.name) else {
            warn!(tool = %invocation.name, "model requested unknown tool");
            return ToolOutcome::error(
                &invocation.id,
                format!("Unknown tool: {}", invocation.name),
            );
        };
        debug!(tool = %invocation.name, call_id = %invocation.id, "executing tool");
        let ctx = ToolContext {
            call_id: invocation.id.clone(),
            session_id: session.id().to_string(),
            agent_name: self.config.name.clone(),
            working_dir: self.config.working_dir.clone(),
            cancel: cancel.clone(),
        };
        match tool.execute(&invocation.input, &ctx).await {
            Ok(result) => ToolOutcome {
                invocation_id: invocation.id.clone(),
                content: result.content,
                is_error: result.is_error,
                metadata: result.metadata,
            },
            Err(e) => ToolOutcome::error(&invocation.id, e.to_string()),
        }
    }

    /// Streamed text that arrived before a provider failure stays in the
    /// session so a retry run keeps the partial context.
    fn save_partial(&self, session: &Session, acc: &TurnAccumulator) {
        if !acc.content.is_empty() {
            session.add_message(Message::assistant(acc.content.clone()));
        }
    }

    /// Terminal path for provider failures: `done(canceled)` when the token
    /// fired, otherwise `error` followed by `done(error)`.
    async fn finish_with_provider_failure(
        &self,
        cancel: &CancellationToken,
        emitter: &Emitter,
        message: String,
        usage: Option<TokenUsage>,
    ) {
        if cancel.is_cancelled() {
            emitter
                .emit(AgentEvent::Done {
                    reason: FinishReason::Canceled,
                    usage,
                })
                .await;
            return;
        }
        warn!(error = %message, agent = %self.config.name, "provider stream failed");
        emitter.emit(AgentEvent::Error { message }).await;
        emitter
            .emit(AgentEvent::Done {
                reason: FinishReason::Error,
                usage,
            })
            .await;
    }
}

/// An agent exposed as a tool: `{ prompt: string }` in, final reply out.
pub struct AgentTool {
    name: String,
    description: String,
    agent: Agent,
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the agent"
                }
            }
        })
    }

    fn required(&self) -> Vec<String> {
        vec!["prompt".into()]
    }

    async fn execute(&self, input: &str, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Value = serde_json::from_str(input).unwrap_or(Value::Null);
        let Some(prompt) = args["prompt"].as_str() else {
            return Ok(ToolResult::error("missing required argument: prompt"));
        };

        let mut stream = self.agent.run(
            prompt,
            RunOptions {
                cancel: Some(ctx.cancel.clone()),
                ..Default::default()
            },
        );
        let mut last_reply: Option<String> = None;
        while let Some(event) = stream.next().await {
            if let AgentEvent::Message { message } = event {
                if message.role == arbor_model::Role::Assistant && !message.content.is_empty() {
                    last_reply = Some(message.content);
                }
            }
        }
        Ok(ToolResult::ok(
            last_reply.unwrap_or_else(|| "(no response)".into()),
        ))
    }
}
