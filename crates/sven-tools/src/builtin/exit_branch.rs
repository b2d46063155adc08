// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: close the active branch and restore the parent's main
/// toolset. Refuses while staged-but-uncommitted ops exist.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct ExitBranchTool;

#[async_trait]
impl Tool for ExitBranchTool {
    fn name(&self) -> &str { "exit_branch" }

    fn description(&self) -> &str {
        "Close this branch and return control to the parent conversation. \
         Refuses to close while staged edits are pending — call \
         commit_changes or rollback_changes first. Always call this once \
         your edits are committed (or discarded), so the branch doesn't sit \
         idle until its iteration budget runs out."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "exit_branch is handled by the branch engine, not the tool registry")
    }
}
