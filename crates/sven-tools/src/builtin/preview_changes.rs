// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: enumerate staged ops against the parent and estimate
/// the net token delta they would apply, without mutating anything.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct PreviewChangesTool;

#[async_trait]
impl Tool for PreviewChangesTool {
    fn name(&self) -> &str { "preview_changes" }

    fn description(&self) -> &str {
        "List every staged edit (rewrite_chunk, compress_chunks, \
         remove_chunks) and the estimated net token delta they would apply \
         to the parent conversation. Does not mutate anything — call \
         commit_changes to apply."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "preview_changes is handled by the branch engine, not the tool registry")
    }
}
