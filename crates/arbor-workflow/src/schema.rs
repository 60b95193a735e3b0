// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use arbor_model::Provider;
use arbor_sandbox::SandboxConfig;
use arbor_tools::Tool;

use crate::{events::WorkflowResult, workflow::WorkflowContext};

/// Serde default helper that returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_turns_per_agent() -> u32 {
    20
}

/// Configuration of a workflow's main agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainAgentConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl MainAgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: None,
            temperature: None,
        }
    }
}

/// Sub-agent admission policy for the synthesized `delegate` tool.
#[derive(Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Concurrently active sub-agents admitted before the tool starts
    /// refusing spawns.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_turns_per_agent")]
    pub max_turns_per_agent: u32,
    /// When set, sub-agents may only use these models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    /// Sub-agents inherit the workflow's shared tool set.
    #[serde(default = "default_true")]
    pub inherit_tools: bool,
    /// Extra tools available only to sub-agents.
    #[serde(skip)]
    pub sub_agent_tools: Vec<Arc<dyn Tool>>,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            max_turns_per_agent: default_max_turns_per_agent(),
            allowed_models: None,
            inherit_tools: true,
            sub_agent_tools: Vec::new(),
        }
    }
}

impl std::fmt::Debug for DelegationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationConfig")
            .field("enabled", &self.enabled)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_turns_per_agent", &self.max_turns_per_agent)
            .field("allowed_models", &self.allowed_models)
            .field("inherit_tools", &self.inherit_tools)
            .field("sub_agent_tools", &self.sub_agent_tools.len())
            .finish()
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type BeforeRunHook = Arc<dyn Fn(WorkflowContext) -> BoxFuture<()> + Send + Sync>;
pub type AfterRunHook = Arc<dyn Fn(WorkflowContext, WorkflowResult) -> BoxFuture<()> + Send + Sync>;
/// Admission hook: return `false` to block the spawn.
pub type SpawnHook = Arc<dyn Fn(SpawnRequest) -> BoxFuture<bool> + Send + Sync>;

/// What the `delegate` tool is about to spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub model: String,
    pub task: String,
}

/// Lifecycle hooks a deployment plugs into the runner.
#[derive(Clone, Default)]
pub struct WorkflowHooks {
    pub before_run: Option<BeforeRunHook>,
    pub after_run: Option<AfterRunHook>,
    pub on_spawn: Option<SpawnHook>,
}

/// Schema-driven composition: one main agent, named providers, shared
/// tools, and the delegation/sandbox policy around them.
#[derive(Clone)]
pub struct WorkflowSchema {
    pub name: String,
    pub description: String,
    pub agent: MainAgentConfig,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub default_provider: String,
    pub tools: Vec<Arc<dyn Tool>>,
    pub sandbox: Option<SandboxConfig>,
    pub delegation: DelegationConfig,
    pub hooks: WorkflowHooks,
}

impl WorkflowSchema {
    pub fn new(
        name: impl Into<String>,
        agent: MainAgentConfig,
        default_provider: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agent,
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            tools: Vec::new(),
            sandbox: None,
            delegation: DelegationConfig::default(),
            hooks: WorkflowHooks::default(),
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
