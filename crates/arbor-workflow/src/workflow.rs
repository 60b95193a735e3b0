// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arbor_core::{Agent, AgentConfig, AgentEvent, EventBus, RunOptions, Session, SubscriberId};
use arbor_model::{short_id, FinishReason, TokenUsage};
use arbor_sandbox::Sandbox;
use arbor_tools::ToolRegistry;

use crate::{
    delegate::delegation_tool,
    events::{WorkflowEvent, WorkflowPayload, WorkflowResult, WorkflowStatus},
    schema::WorkflowSchema,
};

/// Appended to the main agent's system prompt when delegation is enabled.
const DELEGATION_PROMPT: &str = "You can delegate independent tasks with the `delegate` tool: \
give each sub-agent a short name and a self-contained task, and you will receive its final \
reply as the tool result.";

/// Handed to the `before_run` / `after_run` hooks.
#[derive(Clone)]
pub struct WorkflowContext {
    pub run_id: String,
    pub name: String,
    pub prompt: String,
    pub session: Session,
}

#[derive(Default)]
pub struct WorkflowRunOptions {
    /// Session to continue; a fresh in-memory one is created when absent.
    pub session: Option<Session>,
    pub cancel: Option<CancellationToken>,
}

/// Lazy, single-consumer sequence of [`WorkflowEvent`]s.  Dropping it
/// cancels the run.
pub struct WorkflowStream {
    rx: mpsc::Receiver<WorkflowEvent>,
    cancel_on_drop: CancellationToken,
}

impl Stream for WorkflowStream {
    type Item = WorkflowEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WorkflowEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for WorkflowStream {
    fn drop(&mut self) {
        self.cancel_on_drop.cancel();
    }
}

/// Assembles a main agent from a [`WorkflowSchema`] (plus the synthesized
/// `delegate` tool and lifecycle hooks) and drives it, multiplexing
/// sub-agent events from the run-scoped bus into the yielded stream.
#[derive(Clone)]
pub struct Workflow {
    schema: WorkflowSchema,
    run_id: String,
    bus: Arc<EventBus>,
    sandbox: Option<Arc<Sandbox>>,
}

impl Workflow {
    pub fn new(schema: WorkflowSchema) -> Self {
        let sandbox = schema
            .sandbox
            .clone()
            .map(|config| Arc::new(Sandbox::new(config)));
        Self {
            schema,
            run_id: short_id(),
            bus: Arc::new(EventBus::new()),
            sandbox,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn schema(&self) -> &WorkflowSchema {
        &self.schema
    }

    /// The run-scoped event bus.  The `delegate` tool publishes
    /// `agent:spawned` / `agent:event` / `agent:completed` here.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sandbox(&self) -> Option<Arc<Sandbox>> {
        self.sandbox.clone()
    }

    pub fn run(&self, prompt: impl Into<String>, opts: WorkflowRunOptions) -> WorkflowStream {
        let (tx, rx) = mpsc::channel(256);
        let cancel = opts.cancel.map(|c| c.child_token()).unwrap_or_default();
        let session = opts.session.unwrap_or_default();
        let workflow = self.clone();
        let prompt = prompt.into();
        let token = cancel.clone();
        tokio::spawn(async move {
            workflow.drive(prompt, session, token, tx).await;
        });
        WorkflowStream {
            rx,
            cancel_on_drop: cancel,
        }
    }

    async fn drive(
        &self,
        prompt: String,
        session: Session,
        cancel: CancellationToken,
        tx: mpsc::Sender<WorkflowEvent>,
    ) {
        let started_at = Utc::now();
        debug!(run_id = %self.run_id, workflow = %self.schema.name, "workflow started");
        self.send(
            &tx,
            WorkflowPayload::Started {
                name: self.schema.name.clone(),
                prompt: prompt.clone(),
            },
        )
        .await;

        let ctx = WorkflowContext {
            run_id: self.run_id.clone(),
            name: self.schema.name.clone(),
            prompt: prompt.clone(),
            session: session.clone(),
        };
        if let Some(hook) = &self.schema.hooks.before_run {
            hook(ctx.clone()).await;
        }

        let Some(provider) = self.schema.providers.get(&self.schema.default_provider).cloned()
        else {
            let error = format!(
                "Default provider {} not found",
                self.schema.default_provider
            );
            warn!(run_id = %self.run_id, "{error}");
            let finished_at = Utc::now();
            let result = WorkflowResult {
                run_id: self.run_id.clone(),
                status: WorkflowStatus::Error,
                output: String::new(),
                usage: TokenUsage::default(),
                error: Some(error.clone()),
                started_at,
                finished_at,
                duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            };
            self.send(&tx, WorkflowPayload::Failed { error, result }).await;
            return;
        };

        // Effective tool set: shared tools, plus the synthesized `delegate`
        // tool when delegation is enabled.
        let mut registry = ToolRegistry::new();
        for tool in &self.schema.tools {
            registry.register(Arc::clone(tool));
        }
        let mut system_prompt = self.schema.agent.system_prompt.clone().unwrap_or_default();
        if self.schema.delegation.enabled {
            registry.register(delegation_tool(&self.schema, Arc::clone(&self.bus)));
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(DELEGATION_PROMPT);
        }
        if let Some(sandbox) = &self.sandbox {
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&format!(
                "You are working inside a sandbox rooted at {}.",
                sandbox.config().root_dir.display()
            ));
        }

        // Sub-agent events published by the delegate tool are buffered and
        // drained ahead of the next main-agent event, so they surface at
        // approximately their firing order without reordering among
        // themselves.
        let buffer: Arc<Mutex<VecDeque<WorkflowPayload>>> = Arc::default();
        let subscriptions = self.subscribe_buffer(&buffer);

        let mut config = AgentConfig::new(
            format!("{}:main", self.schema.name),
            provider,
            &self.schema.agent.model,
        );
        config.system_prompt = (!system_prompt.is_empty()).then_some(system_prompt);
        config.tools = registry;
        if let Some(max_turns) = self.schema.agent.max_turns {
            config.max_turns = max_turns;
        }
        config.temperature = self.schema.agent.temperature;
        let main_agent = Agent::new(config);
        let main_name = main_agent.name().to_string();

        let mut usage = TokenUsage::default();
        let mut output = String::new();
        let mut done_reason: Option<FinishReason> = None;
        let mut stream = main_agent.run(
            &prompt,
            RunOptions {
                session: Some(session.clone()),
                cancel: Some(cancel.clone()),
                ..Default::default()
            },
        );
        while let Some(event) = stream.next().await {
            self.drain_buffer(&buffer, &mut usage, &tx).await;
            if let Some(u) = event.usage() {
                usage.add(&u);
            }
            match &event {
                AgentEvent::Message { message } => {
                    if message.role == arbor_model::Role::Assistant && !message.content.is_empty()
                    {
                        output = message.content.clone();
                    }
                }
                AgentEvent::Done { reason, .. } => done_reason = Some(*reason),
                _ => {}
            }
            self.send(
                &tx,
                WorkflowPayload::Agent {
                    name: main_name.clone(),
                    event,
                },
            )
            .await;
        }
        self.drain_buffer(&buffer, &mut usage, &tx).await;
        for sub in &subscriptions {
            self.bus.off(sub);
        }

        let finished_at = Utc::now();
        let status = if done_reason == Some(FinishReason::Canceled) {
            WorkflowStatus::Canceled
        } else {
            WorkflowStatus::Completed
        };
        let result = WorkflowResult {
            run_id: self.run_id.clone(),
            status,
            output,
            usage,
            error: None,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        };
        if let Some(hook) = &self.schema.hooks.after_run {
            hook(ctx, result.clone()).await;
        }
        debug!(run_id = %self.run_id, status = ?status, "workflow finished");
        self.send(&tx, WorkflowPayload::Completed { result }).await;
    }

    fn subscribe_buffer(
        &self,
        buffer: &Arc<Mutex<VecDeque<WorkflowPayload>>>,
    ) -> Vec<SubscriberId> {
        let spawned = {
            let buffer = Arc::clone(buffer);
            self.bus.on("agent:spawned", move |data| {
                let (name, model, task) = (
                    data["name"].as_str().unwrap_or("").to_string(),
                    data["model"].as_str().unwrap_or("").to_string(),
                    data["task"].as_str().unwrap_or("").to_string(),
                );
                buffer
                    .lock()
                    .unwrap()
                    .push_back(WorkflowPayload::AgentSpawned { name, model, task });
            })
        };
        let forwarded = {
            let buffer = Arc::clone(buffer);
            self.bus.on("agent:event", move |data| {
                let name = data["name"].as_str().unwrap_or("").to_string();
                match serde_json::from_value::<AgentEvent>(data["event"].clone()) {
                    Ok(event) => buffer
                        .lock()
                        .unwrap()
                        .push_back(WorkflowPayload::Agent { name, event }),
                    Err(e) => warn!(error = %e, "dropping malformed agent:event payload"),
                }
            })
        };
        let completed = {
            let buffer = Arc::clone(buffer);
            self.bus.on("agent:completed", move |data| {
                let (name, output) = (
                    data["name"].as_str().unwrap_or("").to_string(),
                    data["output"].as_str().unwrap_or("").to_string(),
                );
                buffer
                    .lock()
                    .unwrap()
                    .push_back(WorkflowPayload::AgentCompleted { name, output });
            })
        };
        vec![spawned, forwarded, completed]
    }

    async fn drain_buffer(
        &self,
        buffer: &Arc<Mutex<VecDeque<WorkflowPayload>>>,
        usage: &mut TokenUsage,
        tx: &mpsc::Sender<WorkflowEvent>,
    ) {
        loop {
            let payload = buffer.lock().unwrap().pop_front();
            let Some(payload) = payload else { break };
            if let WorkflowPayload::Agent { event, .. } = &payload {
                if let Some(u) = event.usage() {
                    usage.add(&u);
                }
            }
            self.send(tx, payload).await;
        }
    }

    async fn send(&self, tx: &mpsc::Sender<WorkflowEvent>, payload: WorkflowPayload) {
        let event = WorkflowEvent {
            run_id: self.run_id.clone(),
            payload,
        };
        let _ = tx.send(event).await;
    }
}
