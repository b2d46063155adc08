// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use sven_config::AgentMode;

use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors sven_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A registered tool plus the mutable enable flag the Branch Engine and
/// command vocabulary flip at runtime. The tool itself never carries this
/// state — it stays an immutable, shareable `Arc<dyn Tool>`.
struct ToolEntry {
    tool: Arc<dyn Tool>,
    enabled: bool,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, ToolEntry> is Sync (String is Sync, Arc<T: Send + Sync> is Sync, bool is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - The `enabled` flag is only mutated through `&mut self` methods
// - Parallel tool execution is safe because tools themselves are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, ToolEntry { tool: Arc::new(tool), enabled: true });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.tool.clone())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|e| e.enabled)
    }

    /// Enable a tool by name. No-op if the tool is not registered.
    pub fn enable(&mut self, name: &str) {
        if let Some(e) = self.tools.get_mut(name) {
            e.enabled = true;
        }
    }

    /// Disable a tool by name. No-op if the tool is not registered.
    pub fn disable(&mut self, name: &str) {
        if let Some(e) = self.tools.get_mut(name) {
            e.enabled = false;
        }
    }

    /// Disable every registered tool, then enable exactly `names`. Used by
    /// the Branch Engine to swap in a restricted tool set for a branch's
    /// lifetime.
    pub fn enable_only(&mut self, names: &[&str]) {
        for entry in self.tools.values_mut() {
            entry.enabled = false;
        }
        for name in names {
            if let Some(e) = self.tools.get_mut(*name) {
                e.enabled = true;
            }
        }
    }

    /// Disable every registered tool.
    pub fn disable_all(&mut self) {
        for entry in self.tools.values_mut() {
            entry.enabled = false;
        }
    }

    /// Produce schemas for ALL registered tools (mode- and enabled-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|e| to_schema(&e.tool)).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas only for tools available in the given mode.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values()
            .filter(|e| e.tool.modes().contains(&mode))
            .map(|e| to_schema(&e.tool))
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas for tools that are both enabled and available in the
    /// given mode — what the Turn Engine sends to the LLM Client each turn.
    pub fn get_enabled_schemas(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values()
            .filter(|e| e.enabled && e.tool.modes().contains(&mode))
            .map(|e| to_schema(&e.tool))
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Tools in `category`, optionally restricted to enabled ones.
    pub fn get_by_category(&self, category: &str, enabled_only: bool) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.values()
            .filter(|e| e.tool.category() == category && (!enabled_only || e.enabled))
            .map(|e| e.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Dispatch `call`. Unknown or disabled tools surface a structured error
    /// result back to the model rather than panicking or silently dropping
    /// the call.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(entry) if entry.enabled => entry.tool.execute(call).await,
            Some(_) => ToolOutput::err(&call.id, format!("tool disabled: {}", call.name)),
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn names_for_mode(&self, mode: AgentMode) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values()
            .filter(|e| e.tool.modes().contains(&mode))
            .map(|e| e.tool.name().to_string())
            .collect();
        names.sort();
        names
    }
}

fn to_schema(tool: &Arc<dyn Tool>) -> ToolSchema {
    ToolSchema {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ApprovalPolicy;
    use crate::tool::{Tool, ToolCall, ToolOutput};

    /// Minimal no-op tool for registry tests.
    struct EchoTool { name: &'static str, category: &'static str }

    impl EchoTool {
        fn new(name: &'static str) -> Self {
            Self { name, category: "" }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { self.name }
        fn description(&self) -> &str { "echoes its input" }
        fn parameters_schema(&self) -> Value { json!({ "type": "object" }) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        fn category(&self) -> &str { self.category }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("echo"));
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_returns_all_registered() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("a"));
        reg.register(EchoTool::new("b"));
        let mut names = reg.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn schemas_contains_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("my_tool"));
        let schemas = reg.schemas();
        assert!(schemas.iter().any(|s| s.name == "my_tool"));
    }

    #[test]
    fn schemas_include_description() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("t"));
        let schemas = reg.schemas();
        assert_eq!(schemas[0].description, "echoes its input");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("echo"));
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("t"));
        reg.register(EchoTool::new("t"));
        assert_eq!(reg.names().len(), 1);
    }

    // ── enable / disable ─────────────────────────────────────────────────

    #[test]
    fn newly_registered_tool_is_enabled_by_default() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("t"));
        assert!(reg.is_enabled("t"));
    }

    #[test]
    fn disable_then_enable_round_trips() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("t"));
        reg.disable("t");
        assert!(!reg.is_enabled("t"));
        reg.enable("t");
        assert!(reg.is_enabled("t"));
    }

    #[tokio::test]
    async fn execute_disabled_tool_returns_error_not_panic() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("t"));
        reg.disable("t");
        let call = ToolCall { id: "1".into(), name: "t".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("disabled"));
    }

    #[test]
    fn disable_all_disables_every_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("a"));
        reg.register(EchoTool::new("b"));
        reg.disable_all();
        assert!(!reg.is_enabled("a"));
        assert!(!reg.is_enabled("b"));
    }

    #[test]
    fn enable_only_restricts_to_named_set() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("a"));
        reg.register(EchoTool::new("b"));
        reg.register(EchoTool::new("c"));
        reg.enable_only(&["b"]);
        assert!(!reg.is_enabled("a"));
        assert!(reg.is_enabled("b"));
        assert!(!reg.is_enabled("c"));
    }

    #[test]
    fn get_enabled_schemas_excludes_disabled() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::new("a"));
        reg.register(EchoTool::new("b"));
        reg.disable("b");
        let schemas = reg.get_enabled_schemas(AgentMode::Agent);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "a");
    }

    // ── category ──────────────────────────────────────────────────────────

    #[test]
    fn get_by_category_filters_by_category() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "sh", category: "shell" });
        reg.register(EchoTool { name: "other", category: "" });
        let shells = reg.get_by_category("shell", false);
        assert_eq!(shells.len(), 1);
        assert_eq!(shells[0].name(), "sh");
    }

    #[test]
    fn get_by_category_enabled_only_excludes_disabled() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "sh", category: "shell" });
        reg.disable("sh");
        assert!(reg.get_by_category("shell", true).is_empty());
        assert_eq!(reg.get_by_category("shell", false).len(), 1);
    }
}
