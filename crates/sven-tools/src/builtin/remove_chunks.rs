// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: stage removal of one or more parent chunks by index.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct RemoveChunksTool;

#[async_trait]
impl Tool for RemoveChunksTool {
    fn name(&self) -> &str { "remove_chunks" }

    fn description(&self) -> &str {
        "Stage removal of one or more parent chunks, by the indices shown in \
         the chunk overview. Staged only — call preview_changes to see the \
         estimated token delta, then commit_changes to apply."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "indices": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "Chunk indices to remove"
                }
            },
            "required": ["indices"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "remove_chunks is handled by the branch engine, not the tool registry")
    }
}
