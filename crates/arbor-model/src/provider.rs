// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{FinishReason, Message, TokenUsage, ToolInvocation, ToolSchema};

pub type ProviderStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// A single streamed event from a model backend.
///
/// Ordering contract: each `ToolUseStart` is matched by exactly one
/// `ToolUseStop`, with only `ToolUseDelta` fragments between them for that
/// invocation; invocations are never interleaved.  Exactly one of
/// `Complete` or `Error` terminates the stream.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Partial internal reasoning text.
    ThinkingDelta(String),
    /// Partial user-visible text.
    ContentDelta(String),
    /// A new tool invocation opens.
    ToolUseStart { id: String, name: String },
    /// Appended input-JSON fragment for the currently open invocation.
    ToolUseDelta(String),
    /// Closes the currently open invocation.
    ToolUseStop,
    /// Terminal failure prior to `Complete`.
    Error(String),
    /// Final event: finish reason, the full invocation list, and usage.
    Complete {
        finish_reason: FinishReason,
        tool_calls: Vec<ToolInvocation>,
        usage: TokenUsage,
    },
}

/// Per-call options handed to [`Provider::stream`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub model: String,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolSchema>,
    /// Cooperative cancellation: when this token fires between chunks,
    /// adapters end the stream early with a final `Complete(Canceled)`.
    pub cancel: CancellationToken,
}

/// A streaming source of partial model output.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name used for lookup and status display.
    fn name(&self) -> &str;

    /// Send the conversation and return a lazy stream of partial events.
    async fn stream(
        &self,
        messages: &[Message],
        opts: StreamOptions,
    ) -> anyhow::Result<ProviderStream>;
}

/// Wrap an adapter's event stream so cancellation keeps the one-terminal
/// contract: when `cancel` fires the underlying stream is cut off and a
/// final `Complete(Canceled)` is appended, unless a terminal event already
/// went out.
pub(crate) fn end_on_cancel(
    stream: impl Stream<Item = anyhow::Result<ProviderEvent>> + Send + 'static,
    cancel: CancellationToken,
) -> ProviderStream {
    let terminated = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&terminated);
    let wrapped = stream
        .inspect(move |event| {
            if matches!(
                event,
                Ok(ProviderEvent::Complete { .. }) | Ok(ProviderEvent::Error(_))
            ) {
                seen.store(true, Ordering::Relaxed);
            }
        })
        .take_until(cancel.clone().cancelled_owned())
        .chain(
            futures::stream::once(async move {
                if cancel.is_cancelled() && !terminated.load(Ordering::Relaxed) {
                    vec![Ok(ProviderEvent::Complete {
                        finish_reason: FinishReason::Canceled,
                        tool_calls: Vec::new(),
                        usage: TokenUsage::default(),
                    })]
                } else {
                    Vec::new()
                }
            })
            .flat_map(futures::stream::iter),
        );
    Box::pin(wrapped)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
