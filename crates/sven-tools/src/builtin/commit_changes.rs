// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Branch-mode tool: apply every staged op to the parent conversation —
/// rewrites, then compresses, then removals (back-to-front). Atomic: either
/// every staged op succeeds or none are applied. Double-commit is rejected.
///
/// Intercepted and executed by the agent directly; `execute` is never
/// reached in a running agent.
pub struct CommitChangesTool;

#[async_trait]
impl Tool for CommitChangesTool {
    fn name(&self) -> &str { "commit_changes" }

    fn description(&self) -> &str {
        "Apply every staged edit to the parent conversation: rewrites first, \
         then compresses, then removals (processed back-to-front so indices \
         stay valid). Either all staged ops succeed or none are applied. A \
         branch can only commit once."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "commit_changes is handled by the branch engine, not the tool registry")
    }
}
