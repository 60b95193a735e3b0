// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod delegate;
mod events;
mod manager;
mod schema;
mod workflow;

pub use events::{WorkflowEvent, WorkflowPayload, WorkflowResult, WorkflowStatus};
pub use manager::{PolicySnapshot, SubAgentInfo, SubAgentStatus, WorkflowManager, WorkflowRunInfo};
pub use schema::{
    AfterRunHook, BeforeRunHook, DelegationConfig, MainAgentConfig, SpawnHook, SpawnRequest,
    WorkflowHooks, WorkflowSchema,
};
pub use workflow::{Workflow, WorkflowContext, WorkflowRunOptions, WorkflowStream};
