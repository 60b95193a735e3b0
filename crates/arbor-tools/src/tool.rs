// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Execution context handed to a tool by the turn loop.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Id of the originating invocation, attached by the loop.
    pub call_id: String,
    /// Session the invoking run is appending to.
    pub session_id: String,
    /// Name of the invoking agent.
    pub agent_name: String,
    /// Working directory of the invoking agent, when configured.
    pub working_dir: Option<PathBuf>,
    /// Fires when the run is cancelled; long-running tools should honor it.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(
        call_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            working_dir: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    /// True when the tool failed non-fatally (the message is the error text).
    pub is_error: bool,
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A named, schema-described unit of side-effecting work invocable by an
/// agent.
///
/// `input` is the raw JSON serialization of the arguments exactly as the
/// model produced it; tools parse it themselves.  Failures can be reported
/// either as `Err` (the loop converts them to error outcomes) or as
/// [`ToolResult::error`] when the tool wants to control the message text.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Names of the required parameters.  Default: none.
    fn required(&self) -> Vec<String> {
        Vec::new()
    }
    async fn execute(&self, input: &str, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
