//! Tool registry contract
//!
//! The runtime is an orchestration engine, not a tool host: it consumes a
//! [`ToolRegistry`] implemented downstream. The contract is two operations —
//! list definitions, invoke a call — plus a deterministic ordering rule for
//! whenever a batch of calls must be processed in a stable order.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared tool surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within a registry)
    pub name: String,
    /// Human/model-facing description
    pub description: String,
    /// JSON schema of the tool's arguments
    pub json_schema: Value,
}

/// One tool invocation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id (correlates request and result)
    pub id: String,
    /// Tool to invoke
    pub name: String,
    /// Arguments as a JSON text
    pub arguments_json: String,
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the originating call
    pub tool_call_id: String,
    /// Tool output content
    pub content: Value,
}

/// Registry of invokable tools (consumed contract)
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Definitions of every available tool
    fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Invoke one call
    async fn invoke(&self, call: ToolCall) -> Result<ToolResult>;
}

/// Sort calls deterministically by `(name, id, arguments_json)`
pub fn sort_tool_calls(calls: &mut [ToolCall]) {
    calls.sort_by(|a, b| {
        (a.name.as_str(), a.id.as_str(), a.arguments_json.as_str()).cmp(&(
            b.name.as_str(),
            b.id.as_str(),
            b.arguments_json.as_str(),
        ))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, id: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments_json: args.to_string(),
        }
    }

    #[test]
    fn test_sort_tool_calls_order() {
        let mut calls = vec![
            call("search", "2", "{}"),
            call("fetch", "9", "{}"),
            call("search", "1", "{\"q\":\"b\"}"),
            call("search", "1", "{\"q\":\"a\"}"),
        ];
        sort_tool_calls(&mut calls);
        let keys: Vec<(&str, &str, &str)> = calls
            .iter()
            .map(|c| (c.name.as_str(), c.id.as_str(), c.arguments_json.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("fetch", "9", "{}"),
                ("search", "1", "{\"q\":\"a\"}"),
                ("search", "1", "{\"q\":\"b\"}"),
                ("search", "2", "{}"),
            ]
        );
    }
}
