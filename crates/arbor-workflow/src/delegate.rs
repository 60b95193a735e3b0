use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use arbor_core::{Agent, AgentConfig, AgentEvent, EventBus, RunOptions};
use arbor_model::{Provider, Role};
use arbor_tools::{Tool, ToolContext, ToolResult};

use crate::schema::{SpawnRequest, WorkflowSchema};

/// Sub-agent output stored on `agent:completed` is capped at this length.
pub(crate) const OUTPUT_PREVIEW_LEN: usize = 200;

/// Synthesize the `delegate` tool for a workflow: a supervised sub-agent
/// spawner with concurrency, model, and policy admission, forwarding the
/// merged sub-agent event stream onto the workflow bus.
pub(crate) fn delegation_tool(schema: &WorkflowSchema, bus: Arc<EventBus>) -> Arc<dyn Tool> {
    Arc::new(DelegateTool {
        providers: schema.providers.clone(),
        default_provider: schema.default_provider.clone(),
        main_model: schema.agent.model.clone(),
        max_concurrent: schema.delegation.max_concurrent,
        max_turns_per_agent: schema.delegation.max_turns_per_agent,
        allowed_models: schema.delegation.allowed_models.clone(),
        inherit_tools: schema.delegation.inherit_tools,
        shared_tools: schema.tools.clone(),
        sub_agent_tools: schema.delegation.sub_agent_tools.clone(),
        on_spawn: schema.hooks.on_spawn.clone(),
        bus,
        active: AtomicUsize::new(0),
    })
}

struct DelegateTool {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
    main_model: String,
    max_concurrent: usize,
    max_turns_per_agent: u32,
    allowed_models: Option<Vec<String>>,
    inherit_tools: bool,
    shared_tools: Vec<Arc<dyn Tool>>,
    sub_agent_tools: Vec<Arc<dyn Tool>>,
    on_spawn: Option<crate::schema::SpawnHook>,
    bus: Arc<EventBus>,
    active: AtomicUsize,
}

/// Decrements the active counter on every exit path.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn truncate_output(s: &str) -> String {
    if s.chars().count() <= OUTPUT_PREVIEW_LEN {
        s.to_string()
    } else {
        s.chars().take(OUTPUT_PREVIEW_LEN).collect()
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Spawn a focused sub-agent to work on a task and return its final reply. \
         Use one sub-agent per independent task."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Short name for the sub-agent" },
                "task": { "type": "string", "description": "The task to complete" },
                "model": { "type": "string", "description": "Model override" },
                "provider": { "type": "string", "description": "Provider name override" },
                "system_prompt": { "type": "string", "description": "System prompt override" }
            }
        })
    }

    fn required(&self) -> Vec<String> {
        vec!["name".into(), "task".into()]
    }

    async fn execute(&self, input: &str, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: Value = serde_json::from_str(input).unwrap_or(Value::Null);
        let Some(name) = args["name"].as_str().map(str::to_string) else {
            return Ok(ToolResult::error("missing required argument: name"));
        };
        let Some(task) = args["task"].as_str().map(str::to_string) else {
            return Ok(ToolResult::error("missing required argument: task"));
        };

        // Admission, in order: concurrency cap, model policy, provider
        // lookup, spawn hook.
        if self.active.load(Ordering::SeqCst) >= self.max_concurrent {
            return Ok(ToolResult::error(format!(
                "Cannot spawn sub-agent: {} sub-agents are already active (max {})",
                self.active.load(Ordering::SeqCst),
                self.max_concurrent
            )));
        }

        let model = args["model"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.main_model.clone());
        if let Some(allowed) = &self.allowed_models {
            if !allowed.contains(&model) {
                return Ok(ToolResult::error(format!(
                    "Model {model} is not allowed for sub-agents (allowed: {})",
                    allowed.join(", ")
                )));
            }
        }

        let provider_name = args["provider"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.default_provider.clone());
        let Some(provider) = self.providers.get(&provider_name).cloned() else {
            let mut available: Vec<&str> = self.providers.keys().map(String::as_str).collect();
            available.sort();
            return Ok(ToolResult::error(format!(
                "Provider '{provider_name}' not found. Available: {}",
                available.join(", ")
            )));
        };

        if let Some(hook) = &self.on_spawn {
            let admitted = hook(SpawnRequest {
                name: name.clone(),
                model: model.clone(),
                task: task.clone(),
            })
            .await;
            if !admitted {
                warn!(name = %name, "spawn blocked by workflow policy");
                return Ok(ToolResult::error("spawn blocked by workflow policy"));
            }
        }

        debug!(name = %name, model = %model, "spawning sub-agent");
        self.bus.emit(
            "agent:spawned",
            json!({ "name": name, "model": model, "task": task }),
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let mut config = AgentConfig::new(&name, provider, &model);
        config.system_prompt = Some(
            args["system_prompt"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "You are a focused sub-agent named {name}. Complete the assigned \
                         task and report the result concisely."
                    )
                }),
        );
        config.max_turns = self.max_turns_per_agent;
        if self.inherit_tools {
            for tool in &self.shared_tools {
                config.tools.register(Arc::clone(tool));
            }
        }
        // The tool set never includes `delegate` itself, so delegation does
        // not nest.
        for tool in &self.sub_agent_tools {
            config.tools.register(Arc::clone(tool));
        }

        let agent = Agent::new(config);
        let mut stream = agent.run(
            &task,
            RunOptions {
                cancel: Some(ctx.cancel.clone()),
                ..Default::default()
            },
        );

        let mut last_reply: Option<String> = None;
        while let Some(event) = stream.next().await {
            if let AgentEvent::Message { message } = &event {
                if message.role == Role::Assistant && !message.content.is_empty() {
                    last_reply = Some(message.content.clone());
                }
            }
            self.bus
                .emit("agent:event", json!({ "name": name, "event": event }));
        }

        let output = last_reply.unwrap_or_else(|| "(no response)".into());
        self.bus.emit(
            "agent:completed",
            json!({ "name": name, "output": truncate_output(&output) }),
        );
        Ok(ToolResult::ok(output))
    }
}
