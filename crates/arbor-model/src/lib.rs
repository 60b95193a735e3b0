// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod anthropic;
mod mock;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::ScriptedProvider;
pub use openai::OpenAiProvider;
pub use provider::{Provider, ProviderEvent, ProviderStream, StreamOptions};
pub use types::{
    short_id, FinishReason, ImageSource, Message, Role, TokenUsage, ToolInvocation, ToolOutcome,
    ToolSchema,
};
