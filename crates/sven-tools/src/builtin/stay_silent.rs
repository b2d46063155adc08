// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Tells the Turn Engine to discard any visible reply for this turn — used
/// when the operator's message doesn't need a response (e.g. a background
/// shell notification the model is only being informed of).
///
/// The Turn Engine detects this call by name before dispatch and never
/// routes it through the registry; `execute` is never reached in a running
/// agent.
pub struct StaySilentTool;

#[async_trait]
impl Tool for StaySilentTool {
    fn name(&self) -> &str { "stay_silent" }

    fn description(&self) -> &str {
        "Call this instead of replying when the current input doesn't need a \
         visible response. The turn ends with nothing shown to the operator."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan, AgentMode::Research] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::err(&call.id, "stay_silent is intercepted by the turn engine, not the tool registry")
    }
}
