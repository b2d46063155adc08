// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: stage a full-content rewrite of one parent chunk.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct RewriteChunkTool;

#[async_trait]
impl Tool for RewriteChunkTool {
    fn name(&self) -> &str { "rewrite_chunk" }

    fn description(&self) -> &str {
        "Stage a replacement of one parent chunk's content, by the index \
         shown in the chunk overview. Staged only — call preview_changes to \
         see the estimated token delta, then commit_changes to apply."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": { "type": "integer", "description": "Chunk index to rewrite" },
                "new_content": { "type": "string", "description": "Replacement text" }
            },
            "required": ["index", "new_content"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "rewrite_chunk is handled by the branch engine, not the tool registry")
    }
}
