// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: stage a compress op over an inclusive range of parent
/// chunks. `start` becomes the summary chunk; `start+1..=end` are marked for
/// removal once committed.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct CompressChunksTool;

#[async_trait]
impl Tool for CompressChunksTool {
    fn name(&self) -> &str { "compress_chunks" }

    fn description(&self) -> &str {
        "Stage a compression of a contiguous range of parent chunks into one \
         summary. `start` is replaced in place by `summary`; chunks \
         `start+1..=end` are removed once you call commit_changes. Staged \
         only — call preview_changes to see the estimated token delta, then \
         commit_changes to apply."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "start": { "type": "integer", "description": "First chunk index in the range (becomes the summary)" },
                "end": { "type": "integer", "description": "Last chunk index in the range (inclusive)" },
                "summary": { "type": "string", "description": "Replacement text for the range" }
            },
            "required": ["start", "end", "summary"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "compress_chunks is handled by the branch engine, not the tool registry")
    }
}
