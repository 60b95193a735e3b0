// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use arbor_core::AgentEvent;
use arbor_model::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Canceled,
    Error,
}

/// Final summary of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: WorkflowStatus,
    /// Last assistant reply from the main agent.
    pub output: String,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// One event on a workflow's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub payload: WorkflowPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowPayload {
    /// The run started.
    Started { name: String, prompt: String },
    /// An agent event, from the main agent or a forwarded sub-agent.
    Agent { name: String, event: AgentEvent },
    /// A sub-agent was admitted and spawned.
    AgentSpawned {
        name: String,
        model: String,
        task: String,
    },
    /// A sub-agent finished; `output` is truncated to 200 characters.
    AgentCompleted { name: String, output: String },
    /// Terminal: the run finished (completed or canceled).
    Completed { result: WorkflowResult },
    /// Terminal: the run failed.
    Failed { error: String, result: WorkflowResult },
}

impl WorkflowEvent {
    /// Wire name used on event buses and by the run registry.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            WorkflowPayload::Started { .. } => "workflow:started",
            WorkflowPayload::Agent { .. } => "agent:event",
            WorkflowPayload::AgentSpawned { .. } => "agent:spawned",
            WorkflowPayload::AgentCompleted { .. } => "agent:completed",
            WorkflowPayload::Completed { .. } => "workflow:completed",
            WorkflowPayload::Failed { .. } => "workflow:error",
        }
    }

    /// The final result, when this is a terminal event.
    pub fn result(&self) -> Option<&WorkflowResult> {
        match &self.payload {
            WorkflowPayload::Completed { result } | WorkflowPayload::Failed { result, .. } => {
                Some(result)
            }
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_the_event_plane() {
        let ev = WorkflowEvent {
            run_id: "r1".into(),
            payload: WorkflowPayload::AgentSpawned {
                name: "coder".into(),
                model: "m".into(),
                task: "t".into(),
            },
        };
        assert_eq!(ev.kind(), "agent:spawned");
        assert!(ev.result().is_none());
    }

    #[test]
    fn terminal_events_expose_their_result() {
        let result = WorkflowResult {
            run_id: "r1".into(),
            status: WorkflowStatus::Completed,
            output: "done".into(),
            usage: TokenUsage::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 0,
        };
        let ev = WorkflowEvent {
            run_id: "r1".into(),
            payload: WorkflowPayload::Completed {
                result: result.clone(),
            },
        };
        assert_eq!(ev.kind(), "workflow:completed");
        assert_eq!(ev.result().unwrap().output, "done");
    }

    #[test]
    fn serializes_with_flattened_tag() {
        let ev = WorkflowEvent {
            run_id: "r1".into(),
            payload: WorkflowPayload::Started {
                name: "wf".into(),
                prompt: "p".into(),
            },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["run_id"], "r1");
        assert_eq!(v["kind"], "started");
        assert_eq!(v["name"], "wf");
    }
}
