// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: show the full, untruncated content of one parent chunk.
///
/// The schema is exposed to the model through the registry so branch turns
/// see it in their tool list, but the call is intercepted and executed by
/// the agent directly against the branch's parent snapshot — this `execute`
/// is never reached in a running agent.
pub struct ViewChunkDetailTool;

#[async_trait]
impl Tool for ViewChunkDetailTool {
    fn name(&self) -> &str { "view_chunk_detail" }

    fn description(&self) -> &str {
        "Show the full content of one chunk from the parent conversation, by \
         the index shown in the chunk overview. Use this before editing a \
         chunk whose preview doesn't give you enough context."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {
                    "type": "integer",
                    "description": "Chunk index as shown in the overview"
                }
            },
            "required": ["index"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "view_chunk_detail is handled by the branch engine, not the tool registry")
    }
}
