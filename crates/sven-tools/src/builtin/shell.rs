// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use sven_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::shell_worker::ShellWorker;
use crate::tool::{OutputCategory, RetentionPolicy, Tool, ToolCall, ToolOutput};

/// Opens the persistent shell, idempotently.
pub struct ShellOpenTool {
    worker: ShellWorker,
}

impl ShellOpenTool {
    pub fn new(worker: ShellWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Tool for ShellOpenTool {
    fn name(&self) -> &str {
        "shell_open"
    }

    fn description(&self) -> &str {
        "Opens the persistent interactive shell session, if not already open. \
         A no-op returning success if a shell is already running. \
         The shell's screen is visible to you as a `[current terminal screen]` block \
         after every command — you do not need to re-read it."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn category(&self) -> &str {
        "shell"
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    /// Idempotent across calls — only the most recent open's result is worth
    /// keeping in context, so every call shares one key.
    fn singleton_key(&self, _call: &ToolCall, _output: &ToolOutput) -> Option<String> {
        Some("shell_open".to_string())
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        debug!("shell_open");
        match self.worker.open().await {
            Ok(()) => ToolOutput::ok(&call.id, self.worker.snapshot().await),
            Err(e) => ToolOutput::err(&call.id, format!("failed to open shell: {e}")),
        }
    }
}

/// Writes a command to the persistent shell and returns its current screen.
pub struct ShellRunCommandTool {
    worker: ShellWorker,
}

impl ShellRunCommandTool {
    pub fn new(worker: ShellWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Tool for ShellRunCommandTool {
    fn name(&self) -> &str {
        "shell_run_command"
    }

    fn description(&self) -> &str {
        "Sends a command to the persistent interactive shell and returns the terminal screen \
         shortly after. Opens the shell first if it is not already running. \
         Use this for long-running or interactive processes (servers, REPLs, watch commands) \
         where you need to see output accumulate across multiple calls. \
         For one-shot commands prefer run_terminal_command. \
         'clear'/'cls'/'reset' and similar screen-wipe commands are rejected — \
         the terminal history stays visible to you."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to send to the shell"
                },
                "wait_output_secs": {
                    "type": "number",
                    "description": "Seconds to wait after sending the command before returning the screen (default 1.0)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn category(&self) -> &str {
        "shell"
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::MaxPairs(5)
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'command'"),
        };
        let wait_secs = call.args.get("wait_output_secs").and_then(|v| v.as_f64()).unwrap_or(1.0);

        debug!(cmd = %command, "shell_run_command");
        match self.worker.enqueue(&command, Duration::from_secs_f64(wait_secs.max(0.0))).await {
            Ok(snapshot) => ToolOutput::ok(&call.id, snapshot),
            Err(e) => ToolOutput::err(&call.id, format!("shell error: {e}")),
        }
    }
}

/// Sends an interrupt signal (SIGINT) to the running shell child.
pub struct ShellInterruptTool {
    worker: ShellWorker,
}

impl ShellInterruptTool {
    pub fn new(worker: ShellWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Tool for ShellInterruptTool {
    fn name(&self) -> &str {
        "shell_interrupt"
    }

    fn description(&self) -> &str {
        "Sends Ctrl+C (SIGINT) to the persistent shell's foreground process. \
         Use this to stop a long-running or hung command without closing the shell session."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn category(&self) -> &str {
        "shell"
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        debug!("shell_interrupt");
        match self.worker.interrupt().await {
            Ok(()) => ToolOutput::ok(&call.id, self.worker.snapshot().await),
            Err(e) => ToolOutput::err(&call.id, format!("interrupt failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn open_is_idempotent_through_the_tool() {
        let worker = ShellWorker::new(4096);
        let tool = ShellOpenTool::new(worker.clone());
        let out1 = tool.execute(&call("1", "shell_open", json!({}))).await;
        assert!(!out1.is_error);
        let out2 = tool.execute(&call("2", "shell_open", json!({}))).await;
        assert!(!out2.is_error);
        worker.close().await;
    }

    #[tokio::test]
    async fn run_command_opens_shell_and_captures_output() {
        let worker = ShellWorker::new(65536);
        let tool = ShellRunCommandTool::new(worker.clone());
        let out = tool
            .execute(&call("1", "shell_run_command", json!({"command": "echo from_tool", "wait_output_secs": 0.3})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("from_tool"), "{}", out.content);
        worker.close().await;
    }

    #[tokio::test]
    async fn run_command_rejects_clear() {
        let worker = ShellWorker::new(4096);
        let tool = ShellRunCommandTool::new(worker.clone());
        let out = tool.execute(&call("1", "shell_run_command", json!({"command": "clear"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("not permitted"));
    }

    #[tokio::test]
    async fn run_command_missing_argument_errors() {
        let worker = ShellWorker::new(4096);
        let tool = ShellRunCommandTool::new(worker);
        let out = tool.execute(&call("1", "shell_run_command", json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn interrupt_on_unopened_shell_does_not_error() {
        let worker = ShellWorker::new(4096);
        let tool = ShellInterruptTool::new(worker);
        let out = tool.execute(&call("1", "shell_interrupt", json!({}))).await;
        assert!(!out.is_error);
    }

    #[test]
    fn run_command_category_is_shell() {
        let tool = ShellRunCommandTool::new(ShellWorker::new(4096));
        assert_eq!(tool.category(), "shell");
    }

    #[test]
    fn run_command_has_bounded_retention() {
        let tool = ShellRunCommandTool::new(ShellWorker::new(4096));
        assert_eq!(tool.retention(), RetentionPolicy::MaxPairs(5));
    }

    #[test]
    fn open_singleton_key_is_stable_across_calls() {
        let tool = ShellOpenTool::new(ShellWorker::new(4096));
        let out = ToolOutput::ok("1", "screen");
        let key1 = tool.singleton_key(&call("1", "shell_open", json!({})), &out);
        let key2 = tool.singleton_key(&call("2", "shell_open", json!({})), &out);
        assert_eq!(key1, Some("shell_open".to_string()));
        assert_eq!(key1, key2);
    }
}
