// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: discard every staged op without touching the parent.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct RollbackChangesTool;

#[async_trait]
impl Tool for RollbackChangesTool {
    fn name(&self) -> &str { "rollback_changes" }

    fn description(&self) -> &str {
        "Discard every staged edit (rewrite_chunk, compress_chunks, \
         remove_chunks) without touching the parent conversation. Use this \
         if you change your mind mid-branch before committing."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "rollback_changes is handled by the branch engine, not the tool registry")
    }
}
