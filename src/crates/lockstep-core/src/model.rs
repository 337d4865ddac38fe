//! Model client contract and streaming helpers
//!
//! The runtime is provider-agnostic: node implementations talk to language
//! models through the [`ModelClient`] trait, implemented downstream for a
//! concrete provider. Two operations are required:
//!
//! - [`complete`](ModelClient::complete) — request in, full response out;
//! - [`stream`](ModelClient::stream) — request in, async chunk sequence out.
//!
//! # Stream invariants
//!
//! A well-formed stream yields zero or more [`ModelChunk::Token`]s followed
//! by exactly one terminal [`ModelChunk::Final`] as its last element: no
//! tokens after the final, no second final, no end-of-stream without one.
//! [`collect_stream`] enforces these and surfaces violations as
//! `modelStreamInvalid`. For the same request, `complete` must return a
//! response semantically equal to the stream's final.

use crate::error::{Result, RuntimeError};
use crate::tool::{sort_tool_calls, ToolCall, ToolRegistry, ToolResult};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Request to a language model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Conversation messages (message-shaped objects)
    pub messages: Vec<Value>,
    /// Tool definitions offered to the model
    pub tools: Vec<crate::tool::ToolDefinition>,
    /// Provider-specific parameters, passed through opaquely
    pub params: Value,
}

/// Response from a language model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Assistant message (message-shaped object)
    pub message: Value,
    /// Tool calls the model requested
    pub tool_calls: Vec<ToolCall>,
    /// Provider usage metadata
    pub usage: Option<Value>,
}

/// One element of a model stream
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Incremental token text
    Token(String),
    /// Terminal full response
    Final(ModelResponse),
}

/// Boxed chunk stream returned by [`ModelClient::stream`]
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

/// Language-model client (consumed contract)
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Produce a complete response
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse>;

    /// Produce a chunk stream ending in exactly one `Final`
    fn stream(&self, request: ModelRequest) -> ModelStream;
}

/// Drain a model stream, enforcing the chunk protocol
///
/// Returns the token texts in order and the terminal response. Violations —
/// a token after the final, multiple finals, or stream end without a final —
/// fail with [`RuntimeError::ModelStreamInvalid`].
pub async fn collect_stream(
    mut stream: ModelStream,
    mut on_token: impl FnMut(&str),
) -> Result<(Vec<String>, ModelResponse)> {
    let mut tokens = Vec::new();
    let mut terminal: Option<ModelResponse> = None;
    while let Some(chunk) = stream.next().await {
        match chunk? {
            ModelChunk::Token(text) => {
                if terminal.is_some() {
                    return Err(RuntimeError::ModelStreamInvalid(
                        "token after final response".to_string(),
                    ));
                }
                on_token(&text);
                tokens.push(text);
            }
            ModelChunk::Final(response) => {
                if terminal.is_some() {
                    return Err(RuntimeError::ModelStreamInvalid(
                        "multiple final responses".to_string(),
                    ));
                }
                terminal = Some(response);
            }
        }
    }
    match terminal {
        Some(response) => Ok((tokens, response)),
        None => Err(RuntimeError::ModelStreamInvalid(
            "stream ended without a final response".to_string(),
        )),
    }
}

/// Bounded model + tool loop
///
/// Repeatedly completes the request, invoking requested tools (in the
/// deterministic `(name, id, arguments_json)` order) and feeding their
/// results back as messages, until the model stops requesting tools. Each
/// `complete` call counts as one invocation against `max_invocations`.
pub async fn run_model_tool_loop(
    model: &dyn ModelClient,
    tools: &dyn ToolRegistry,
    mut request: ModelRequest,
    max_invocations: u32,
) -> Result<ModelResponse> {
    for _ in 0..max_invocations {
        let response = model.complete(request.clone()).await?;
        if response.tool_calls.is_empty() {
            return Ok(response);
        }
        request.messages.push(response.message.clone());
        let mut calls = response.tool_calls.clone();
        sort_tool_calls(&mut calls);
        for call in calls {
            let ToolResult {
                tool_call_id,
                content,
            } = tools.invoke(call).await?;
            request.messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }));
        }
    }
    Err(RuntimeError::ModelToolLoopMaxInvocationsExceeded(
        max_invocations,
    ))
}

/// Convenience alias for shared model clients
pub type ModelClientRef = Arc<dyn ModelClient>;

/// Convenience alias for shared tool registries
pub type ToolRegistryRef = Arc<dyn ToolRegistry>;
