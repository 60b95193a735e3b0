// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::debug;

use arbor_core::{AgentEvent, EventBus};
use arbor_model::{FinishReason, TokenUsage};

use crate::{
    delegate::truncate_output,
    events::{WorkflowEvent, WorkflowPayload, WorkflowStatus},
    schema::WorkflowSchema,
    workflow::{Workflow, WorkflowRunOptions},
};

/// `recent_events` keeps at most this many entries per run.
const RECENT_EVENTS_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentStatus {
    Running,
    Completed,
    Error,
}

/// Snapshot of one sub-agent observed on a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentInfo {
    pub name: String,
    pub model: String,
    pub status: SubAgentStatus,
    pub spawned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub task: String,
    /// Truncated to 200 characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub event_count: u64,
}

/// What the run was configured with, captured from the schema at start.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySnapshot {
    pub agent: crate::schema::MainAgentConfig,
    pub default_provider: String,
    pub providers: Vec<String>,
    pub tools: Vec<String>,
    pub delegation_enabled: bool,
    pub max_concurrent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<String>,
}

/// Materialized snapshot of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunInfo {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub policy: PolicySnapshot,
    /// Sub-agents in spawn order.
    pub agents: Vec<SubAgentInfo>,
    pub usage: TokenUsage,
    pub output: String,
    /// Bounded ring of the most recent workflow events.
    pub recent_events: VecDeque<WorkflowEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::events::WorkflowResult>,
}

/// Run registry for workflow instances.
///
/// Observes each run's event stream, materializes event-indexed
/// [`WorkflowRunInfo`] snapshots, and re-emits every event on the manager
/// bus under its kind (`workflow:started`, `agent:spawned`, …).
pub struct WorkflowManager {
    bus: Arc<EventBus>,
    runs: Mutex<HashMap<String, WorkflowRunInfo>>,
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Construct a workflow from the schema, store its snapshot, and drain
    /// its stream in the background.  Returns the run id.
    pub fn start_run(
        self: &Arc<Self>,
        schema: WorkflowSchema,
        prompt: &str,
        opts: WorkflowRunOptions,
    ) -> String {
        let workflow = Workflow::new(schema);
        let run_id = workflow.run_id().to_string();
        let schema = workflow.schema();

        let mut providers: Vec<String> = schema.providers.keys().cloned().collect();
        providers.sort();
        let info = WorkflowRunInfo {
            id: run_id.clone(),
            name: schema.name.clone(),
            status: WorkflowStatus::Running,
            prompt: prompt.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            policy: PolicySnapshot {
                agent: schema.agent.clone(),
                default_provider: schema.default_provider.clone(),
                providers,
                tools: schema.tools.iter().map(|t| t.name().to_string()).collect(),
                delegation_enabled: schema.delegation.enabled,
                max_concurrent: schema.delegation.max_concurrent,
                sandbox_root: schema
                    .sandbox
                    .as_ref()
                    .map(|s| s.root_dir.display().to_string()),
            },
            agents: Vec::new(),
            usage: TokenUsage::default(),
            output: String::new(),
            recent_events: VecDeque::new(),
            result: None,
        };
        self.runs.lock().unwrap().insert(run_id.clone(), info);
        debug!(run_id = %run_id, "workflow run registered");

        let manager = Arc::clone(self);
        let mut stream = workflow.run(prompt, opts);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                manager.process(event);
            }
        });
        run_id
    }

    fn process(&self, event: WorkflowEvent) {
        {
            let mut runs = self.runs.lock().unwrap();
            let Some(run) = runs.get_mut(&event.run_id) else {
                return;
            };

            run.recent_events.push_back(event.clone());
            if run.recent_events.len() > RECENT_EVENTS_CAP {
                run.recent_events.pop_front();
            }

            match &event.payload {
                WorkflowPayload::Started { .. } => {}
                WorkflowPayload::AgentSpawned { name, model, task } => {
                    run.agents.push(SubAgentInfo {
                        name: name.clone(),
                        model: model.clone(),
                        status: SubAgentStatus::Running,
                        spawned_at: Utc::now(),
                        completed_at: None,
                        task: task.clone(),
                        output: None,
                        event_count: 0,
                    });
                }
                WorkflowPayload::AgentCompleted { name, output } => {
                    if let Some(agent) = run
                        .agents
                        .iter_mut()
                        .rev()
                        .find(|a| a.name == *name && a.status == SubAgentStatus::Running)
                    {
                        agent.status = SubAgentStatus::Completed;
                        agent.completed_at = Some(Utc::now());
                        agent.output = Some(truncate_output(output));
                    }
                }
                WorkflowPayload::Agent { name, event } => {
                    if let Some(agent) = run
                        .agents
                        .iter_mut()
                        .rev()
                        .find(|a| a.name == *name && a.status != SubAgentStatus::Completed)
                    {
                        agent.event_count += 1;
                        if let AgentEvent::Done {
                            reason: FinishReason::Error,
                            ..
                        } = event
                        {
                            agent.status = SubAgentStatus::Error;
                            agent.completed_at = Some(Utc::now());
                        }
                    }
                    if let Some(usage) = event.usage() {
                        run.usage.add(&usage);
                    }
                }
                WorkflowPayload::Completed { .. } | WorkflowPayload::Failed { .. } => {}
            }

            if let Some(result) = event.result() {
                run.status = result.status;
                run.finished_at = Some(result.finished_at);
                run.duration_ms = Some(result.duration_ms);
                run.output = result.output.clone();
                run.usage = result.usage;
                run.result = Some(result.clone());
            }
        }

        self.bus
            .emit(event.kind(), serde_json::to_value(&event).unwrap_or_default());
    }

    // ── Read-only queries ────────────────────────────────────────────────────

    pub fn get_run(&self, run_id: &str) -> Option<WorkflowRunInfo> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn list_runs(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowRunInfo> {
        let mut runs: Vec<WorkflowRunInfo> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub fn get_agents(&self, run_id: &str) -> Vec<SubAgentInfo> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|r| r.agents.clone())
            .unwrap_or_default()
    }

    /// The most recent events for a run, oldest first, optionally limited
    /// to the trailing `limit`.
    pub fn get_events(&self, run_id: &str, limit: Option<usize>) -> Vec<WorkflowEvent> {
        let runs = self.runs.lock().unwrap();
        let Some(run) = runs.get(run_id) else {
            return Vec::new();
        };
        let events: Vec<WorkflowEvent> = run.recent_events.iter().cloned().collect();
        match limit {
            Some(n) if n < events.len() => events[events.len() - n..].to_vec(),
            _ => events,
        }
    }
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new()
    }
}
