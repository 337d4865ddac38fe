//! Per-task run context
//!
//! Every node task receives a [`RunContext`]: the one-shot resume payload
//! (first resumed step only), emitters for model/tool/debug events, the
//! cancellation token, the injected clock, and the configured model client
//! and tool registry (if any).

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{Result, RuntimeError};
use crate::events::{EventKind, EventQueue, EventScope};
use crate::model::{collect_stream, ModelClientRef, ModelRequest, ModelResponse, ToolRegistryRef};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Where node-emitted events go
///
/// Live mode forwards straight to the run's event queue. Buffered mode
/// (deterministic token streaming) accumulates per task; the engine flushes
/// buffers in ascending task-ordinal order once every task has settled, so
/// concurrent tasks' tokens never interleave.
#[derive(Clone)]
pub(crate) enum EventSink {
    Live(Arc<EventQueue>),
    Buffered(Arc<Mutex<Vec<(EventScope, EventKind)>>>),
}

impl EventSink {
    async fn emit(&self, scope: EventScope, kind: EventKind) {
        match self {
            Self::Live(queue) => queue.emit(scope, kind).await,
            Self::Buffered(buffer) => buffer.lock().expect("event buffer").push((scope, kind)),
        }
    }

    fn emit_droppable(&self, scope: EventScope, kind: EventKind) {
        match self {
            Self::Live(queue) => queue.emit_droppable_now(scope, kind),
            Self::Buffered(buffer) => buffer.lock().expect("event buffer").push((scope, kind)),
        }
    }
}

/// Engine services handed to a node task
#[derive(Clone)]
pub struct RunContext {
    pub(crate) resume: Option<Value>,
    pub(crate) sink: EventSink,
    pub(crate) scope: EventScope,
    pub(crate) node_id: String,
    /// Cooperative cancellation token for this run
    pub cancel: CancelToken,
    /// Injected clock (backoff, node-level timeouts)
    pub clock: Arc<dyn Clock>,
    pub(crate) model: Option<ModelClientRef>,
    pub(crate) tools: Option<ToolRegistryRef>,
}

impl RunContext {
    /// Resume payload, present on every task of the first resumed step only
    pub fn resume(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    /// Node executing this task
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Configured model client, or `modelClientMissing`
    pub fn model_client(&self) -> Result<ModelClientRef> {
        self.model.clone().ok_or(RuntimeError::ModelClientMissing)
    }

    /// Configured tool registry, or `toolRegistryMissing`
    pub fn tool_registry(&self) -> Result<ToolRegistryRef> {
        self.tools.clone().ok_or(RuntimeError::ToolRegistryMissing)
    }

    /// Emit a droppable application debug event
    pub fn emit_custom_debug(&self, data: Value) {
        self.sink
            .emit_droppable(self.scope, EventKind::CustomDebug { data });
    }

    /// Emit one streamed model token (droppable, coalescable)
    pub fn emit_model_token(&self, text: impl Into<String>) {
        self.sink
            .emit_droppable(self.scope, EventKind::ModelToken { text: text.into() });
    }

    /// Announce a model invocation
    pub async fn emit_model_invocation_started(&self) {
        self.sink
            .emit(
                self.scope,
                EventKind::ModelInvocationStarted {
                    node_id: self.node_id.clone(),
                },
            )
            .await;
    }

    /// Conclude a model invocation
    pub async fn emit_model_invocation_finished(&self) {
        self.sink
            .emit(
                self.scope,
                EventKind::ModelInvocationFinished {
                    node_id: self.node_id.clone(),
                },
            )
            .await;
    }

    /// Announce a tool invocation
    pub async fn emit_tool_invocation_started(&self, name: impl Into<String>, call_id: impl Into<String>) {
        self.sink
            .emit(
                self.scope,
                EventKind::ToolInvocationStarted {
                    name: name.into(),
                    call_id: call_id.into(),
                },
            )
            .await;
    }

    /// Conclude a tool invocation
    pub async fn emit_tool_invocation_finished(&self, name: impl Into<String>, call_id: impl Into<String>) {
        self.sink
            .emit(
                self.scope,
                EventKind::ToolInvocationFinished {
                    name: name.into(),
                    call_id: call_id.into(),
                },
            )
            .await;
    }

    /// Stream a model request, emitting invocation and token events
    ///
    /// Convenience wrapper: announces the invocation, drains the validated
    /// chunk stream (each token emitted through this context), concludes the
    /// invocation, and returns the terminal response.
    pub async fn stream_model(&self, request: ModelRequest) -> Result<ModelResponse> {
        let client = self.model_client()?;
        self.emit_model_invocation_started().await;
        let stream = client.stream(request);
        let result = collect_stream(stream, |token| self.emit_model_token(token)).await;
        self.emit_model_invocation_finished().await;
        result.map(|(_tokens, response)| response)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("node_id", &self.node_id)
            .field("has_resume", &self.resume.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}
