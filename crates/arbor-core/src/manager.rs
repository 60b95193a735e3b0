// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use arbor_model::{short_id, TokenUsage};
use arbor_sandbox::Sandbox;

use crate::{
    agent::{Agent, AgentConfig, RunOptions},
    bus::EventBus,
    events::AgentEvent,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Canceled,
}

/// Registry snapshot of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub model: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<String>,
    pub total_tokens: TokenUsage,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Snapshot of one background run, including its captured event sequence.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<AgentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

struct AgentEntry {
    info: AgentInfo,
    agent: Agent,
    sandbox: Option<Arc<Sandbox>>,
}

/// Registry of agents and their background runs.
///
/// Observes every run's event stream, keeps [`RunInfo`] snapshots current,
/// and forwards events on the manager bus (`run:event`, `run:completed`,
/// `agent:registered`, `agent:removed`, `agent:status`).
///
/// Concurrent `start_run` calls on one agent are not serialized: the second
/// run overwrites `current_run_id`.  Callers gate on `current_run_id` when
/// they need one-run-at-a-time behavior.
pub struct AgentManager {
    bus: Arc<EventBus>,
    agents: Mutex<HashMap<String, AgentEntry>>,
    runs: Mutex<HashMap<String, RunInfo>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            agents: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register an agent and its persistent session.
    pub fn register(&self, config: AgentConfig, sandbox: Option<Arc<Sandbox>>) -> String {
        let agent_id = short_id();
        let info = AgentInfo {
            id: agent_id.clone(),
            name: config.name.clone(),
            model: config.model.clone(),
            status: AgentStatus::Idle,
            current_run_id: None,
            total_tokens: TokenUsage::default(),
            created_at: Utc::now(),
            last_active_at: None,
        };
        let name = info.name.clone();
        self.sessions
            .lock()
            .unwrap()
            .insert(agent_id.clone(), Session::new());
        self.agents.lock().unwrap().insert(
            agent_id.clone(),
            AgentEntry {
                info,
                agent: Agent::new(config),
                sandbox,
            },
        );
        debug!(agent_id = %agent_id, name = %name, "agent registered");
        self.bus.emit(
            "agent:registered",
            json!({ "agent_id": agent_id, "name": name }),
        );
        agent_id
    }

    pub fn remove(&self, agent_id: &str) {
        self.agents.lock().unwrap().remove(agent_id);
        self.sessions.lock().unwrap().remove(agent_id);
        self.bus
            .emit("agent:removed", json!({ "agent_id": agent_id }));
    }

    /// Launch a background run on the agent's session.  Returns the run id
    /// immediately; progress is observable via [`get_run`](Self::get_run)
    /// and the `run:event` bus channel.
    ///
    /// A session supplied in `opts` is ignored; the agent's own session is
    /// used so its history spans runs.
    pub fn start_run(
        self: &Arc<Self>,
        agent_id: &str,
        prompt: &str,
        opts: RunOptions,
    ) -> anyhow::Result<String> {
        let run_id = short_id();
        let (agent, session) = {
            let sessions = self.sessions.lock().unwrap();
            let mut agents = self.agents.lock().unwrap();
            let entry = agents
                .get_mut(agent_id)
                .with_context(|| format!("unknown agent: {agent_id}"))?;
            let session = sessions
                .get(agent_id)
                .with_context(|| format!("no session for agent: {agent_id}"))?
                .clone();
            entry.info.status = AgentStatus::Running;
            entry.info.current_run_id = Some(run_id.clone());
            (entry.agent.clone(), session)
        };

        self.runs.lock().unwrap().insert(
            run_id.clone(),
            RunInfo {
                id: run_id.clone(),
                agent_id: agent_id.to_string(),
                status: RunStatus::Running,
                prompt: prompt.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                events: Vec::new(),
                usage: None,
            },
        );
        self.bus.emit(
            "agent:status",
            json!({ "agent_id": agent_id, "status": AgentStatus::Running }),
        );

        let manager = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let run_prompt = prompt.to_string();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            manager
                .supervise(&agent_id, &task_run_id, agent, session, &run_prompt, opts)
                .await;
        });
        Ok(run_id)
    }

    async fn supervise(
        self: &Arc<Self>,
        agent_id: &str,
        run_id: &str,
        agent: Agent,
        session: Session,
        prompt: &str,
        opts: RunOptions,
    ) {
        let mut stream = agent.run(
            prompt,
            RunOptions {
                session: Some(session),
                ..opts
            },
        );

        let mut saw_done = false;
        let mut final_status = RunStatus::Completed;
        let mut final_usage: Option<TokenUsage> = None;
        while let Some(event) = stream.next().await {
            if let AgentEvent::Done { reason, usage } = &event {
                saw_done = true;
                final_usage = *usage;
                final_status = match reason {
                    arbor_model::FinishReason::Canceled => RunStatus::Canceled,
                    arbor_model::FinishReason::Error => RunStatus::Error,
                    _ => RunStatus::Completed,
                };
            }
            if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
                run.events.push(event.clone());
            }
            self.bus.emit(
                "run:event",
                json!({ "run_id": run_id, "agent_id": agent_id, "event": event }),
            );
        }

        if !saw_done {
            // The run task died without its terminal event.
            warn!(run_id, agent_id, "run ended without a done event");
            final_status = RunStatus::Error;
            let synthetic = AgentEvent::Error {
                message: "run terminated unexpectedly".into(),
            };
            if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
                run.events.push(synthetic.clone());
            }
            self.bus.emit(
                "run:event",
                json!({ "run_id": run_id, "agent_id": agent_id, "event": synthetic }),
            );
        }

        let now = Utc::now();
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.status = final_status;
            run.finished_at = Some(now);
            run.usage = final_usage;
        }
        if let Some(entry) = self.agents.lock().unwrap().get_mut(agent_id) {
            entry.info.status = AgentStatus::Idle;
            entry.info.current_run_id = None;
            entry.info.last_active_at = Some(now);
            if let Some(usage) = &final_usage {
                entry.info.total_tokens.add(usage);
            }
        }
        self.bus.emit(
            "run:completed",
            json!({ "run_id": run_id, "agent_id": agent_id, "status": final_status }),
        );
        self.bus.emit(
            "agent:status",
            json!({ "agent_id": agent_id, "status": AgentStatus::Idle }),
        );
    }

    /// Cancel the agent's current run by firing its session's internal
    /// cancellation token.
    pub fn cancel_run(&self, agent_id: &str) {
        let session_id = self
            .sessions
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|s| s.id().to_string());
        if let (Some(session_id), Some(entry)) =
            (session_id, self.agents.lock().unwrap().get(agent_id))
        {
            entry.agent.cancel(&session_id);
        }
    }

    // ── Read-only queries ────────────────────────────────────────────────────

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|e| e.info.clone())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunInfo> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn list_runs(&self, agent_id: Option<&str>) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| agent_id.is_none_or(|id| r.agent_id == id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub fn get_session(&self, agent_id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(agent_id).cloned()
    }

    pub fn get_sandbox(&self, agent_id: &str) -> Option<Arc<Sandbox>> {
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .and_then(|e| e.sandbox.clone())
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}
