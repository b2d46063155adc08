// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Comprehensive tests for the Agent turn loop, tool dispatch, and the
/// branch engine wiring.
///
/// Uses ScriptedMockProvider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod agent_tests {
    use std::sync::Arc;

    use sven_config::{AgentConfig, AgentMode, MemoryConfig};
    use sven_memory::{DeterministicEmbedder, RecallEngine};
    use sven_model::{ResponseEvent, ScriptedMockProvider};
    use sven_tools::{events::ToolEvent, FsTool, RunTerminalCommandTool, ToolRegistry};
    use tokio::sync::{mpsc, Mutex};

    use crate::{Agent, AgentEvent, AgentRuntimeContext, ChunkKind};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn recall() -> RecallEngine {
        RecallEngine::in_memory(&MemoryConfig::default(), Box::new(DeterministicEmbedder::new(32)))
    }

    fn agent_with(
        model: ScriptedMockProvider,
        tools: ToolRegistry,
        config: AgentConfig,
        mode: AgentMode,
    ) -> Agent {
        agent_with_ctx(model, tools, config, mode, 128_000)
    }

    fn agent_with_ctx(
        model: ScriptedMockProvider,
        tools: ToolRegistry,
        config: AgentConfig,
        mode: AgentMode,
        max_context_tokens: usize,
    ) -> Agent {
        let mode_lock = Arc::new(Mutex::new(mode));
        let (_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
        Agent::new(
            Arc::new(model),
            Arc::new(tools),
            Arc::new(config),
            MemoryConfig::default(),
            AgentRuntimeContext::default(),
            mode_lock,
            tool_event_rx,
            recall(),
            max_context_tokens,
        )
    }

    fn default_agent(model: ScriptedMockProvider) -> Agent {
        agent_with(model, ToolRegistry::default(), AgentConfig::default(), AgentMode::Agent)
    }

    /// Drain the channel into a Vec of events, waiting for TurnComplete,
    /// Aborted, Error, or channel close.
    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(
                ev,
                AgentEvent::TurnComplete | AgentEvent::Aborted { .. } | AgentEvent::Error(_)
            );
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    // ── Basic text turn ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_text_turn_emits_text_delta_and_complete() {
        let model = ScriptedMockProvider::always_text("hello from agent");
        let mut agent = default_agent(model);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("hi", tx).await.unwrap();
        let events = collect_events(rx).await;

        let has_delta = events.iter().any(|e| matches!(e, AgentEvent::TextDelta(t) if t.contains("hello")));
        let has_complete = events.iter().any(|e| matches!(e, AgentEvent::TurnComplete));
        assert!(has_delta, "should have emitted at least one TextDelta");
        assert!(has_complete, "should have emitted TurnComplete");
    }

    #[tokio::test]
    async fn text_complete_event_contains_full_response() {
        let model = ScriptedMockProvider::always_text("full response text");
        let mut agent = default_agent(model);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("hi", tx).await.unwrap();
        let events = collect_events(rx).await;

        let complete_text = events.iter().find_map(|e| {
            if let AgentEvent::TextComplete(t) = e { Some(t.as_str()) } else { None }
        });
        assert_eq!(complete_text, Some("full response text"));
    }

    // ── Chunk store history ───────────────────────────────────────────────────

    #[tokio::test]
    async fn system_chunk_injected_on_first_turn() {
        let model = ScriptedMockProvider::always_text("ok");
        let mut agent = default_agent(model);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("go", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let chunks = agent.store().chunks();
        assert_eq!(chunks[0].kind, ChunkKind::System, "first chunk must be system");
    }

    #[tokio::test]
    async fn user_input_appended_to_store() {
        let model = ScriptedMockProvider::always_text("reply");
        let mut agent = default_agent(model);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("my question", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let user_chunk = agent.store().chunks().iter().find(|c| c.kind == ChunkKind::User);
        assert!(user_chunk.is_some());
        assert_eq!(user_chunk.unwrap().content, "my question");
    }

    #[tokio::test]
    async fn assistant_reply_appended_to_store() {
        let model = ScriptedMockProvider::always_text("my reply");
        let mut agent = default_agent(model);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("q", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let asst = agent.store().chunks().iter().find(|c| c.kind == ChunkKind::Assistant);
        assert!(asst.is_some());
        assert!(asst.unwrap().content.contains("my reply"));
    }

    // ── Tool call round-trip ──────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_started_and_finished_events_emitted() {
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1", "run_terminal_command", r#"{"command":"echo finished"}"#, "done",
        );
        let mut reg = ToolRegistry::new();
        reg.register(RunTerminalCommandTool::default());
        let mut agent = agent_with(model, reg, AgentConfig::default(), AgentMode::Agent);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("run something", tx).await.unwrap();
        let events = collect_events(rx).await;

        let started = events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallStarted(tc) if tc.name == "run_terminal_command"));
        assert!(started, "should emit ToolCallStarted for run_terminal_command");

        let finished = events.iter().find_map(|e| match e {
            AgentEvent::ToolCallFinished { tool_name, output, .. } if tool_name == "run_terminal_command" => {
                Some(output.as_str())
            }
            _ => None,
        });
        assert!(finished.is_some());
        assert!(finished.unwrap().contains("finished"), "tool output should contain the echoed text");
    }

    #[tokio::test]
    async fn tool_result_appended_to_store() {
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1", "run_terminal_command", r#"{"command":"echo hi"}"#, "done",
        );
        let mut reg = ToolRegistry::new();
        reg.register(RunTerminalCommandTool::default());
        let mut agent = agent_with(model, reg, AgentConfig::default(), AgentMode::Agent);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("run", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let has_tool_result = agent.store().chunks().iter().any(|c| c.kind == ChunkKind::ToolResult);
        assert!(has_tool_result, "tool result should be appended to the chunk store");
    }

    // ── File tool integration ─────────────────────────────────────────────────

    #[tokio::test]
    async fn fs_tool_write_via_agent_turn() {
        let path = format!(
            "/tmp/sven_agent_test_{}.txt",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        );
        let args = format!(r#"{{"operation":"write","path":"{path}","text":"agent wrote this"}}"#);

        let model = ScriptedMockProvider::tool_then_text("fs-1", "fs", &args, "file written");
        let mut reg = ToolRegistry::new();
        reg.register(FsTool);
        let mut agent = agent_with(model, reg, AgentConfig::default(), AgentMode::Agent);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("write the file", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let content = std::fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(content, "agent wrote this");
        let _ = std::fs::remove_file(&path);
    }

    // ── Max rounds enforcement ────────────────────────────────────────────────

    #[tokio::test]
    async fn max_rounds_nudges_model_to_stop_calling_tools() {
        // Scripted to always return a tool call — the loop must eventually
        // stop calling tools once the budget nudge lands and the model
        // responds with plain text.
        let mut scripts: Vec<Vec<ResponseEvent>> = (0..3)
            .map(|_| {
                vec![
                    ResponseEvent::ToolCall {
                        index: 0,
                        id: "x".into(),
                        name: "run_terminal_command".into(),
                        arguments: r#"{"command":"echo loop"}"#.into(),
                    },
                    ResponseEvent::Done,
                ]
            })
            .collect();
        scripts.push(vec![ResponseEvent::TextDelta("stopping now".into()), ResponseEvent::Done]);

        let model = ScriptedMockProvider::new(scripts);
        let config = AgentConfig { max_tool_rounds: 2, ..AgentConfig::default() };
        let mut reg = ToolRegistry::new();
        reg.register(RunTerminalCommandTool::default());
        let mut agent = agent_with(model, reg, config, AgentMode::Agent);
        let (tx, rx) = mpsc::channel(256);

        agent.submit("loop forever", tx).await.unwrap();
        let events = collect_events(rx).await;

        let saw_final_text = events.iter().any(|e| matches!(e, AgentEvent::TextComplete(t) if t == "stopping now"));
        assert!(saw_final_text, "model should produce a final summary once the tool-round budget nudge lands; got: {events:?}");
    }

    // ── Multi-turn conversation ───────────────────────────────────────────────

    #[tokio::test]
    async fn second_turn_adds_to_existing_history() {
        let model = ScriptedMockProvider::new(vec![
            vec![ResponseEvent::TextDelta("first reply".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("second reply".into()), ResponseEvent::Done],
        ]);
        let mut agent = default_agent(model);

        let (tx1, rx1) = mpsc::channel(64);
        agent.submit("turn one", tx1).await.unwrap();
        let _ = collect_events(rx1).await;

        let chunks_after_first = agent.store().len();

        let (tx2, rx2) = mpsc::channel(64);
        agent.submit("turn two", tx2).await.unwrap();
        let _ = collect_events(rx2).await;

        assert!(agent.store().len() > chunks_after_first, "second turn should append more chunks");
    }

    // ── stay_silent ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stay_silent_suppresses_text_complete_and_turn_complete() {
        let model = ScriptedMockProvider::new(vec![vec![
            ResponseEvent::ToolCall { index: 0, id: "s1".into(), name: "stay_silent".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]]);
        let mut agent = default_agent(model);
        let (tx, mut rx) = mpsc::channel(64);

        agent.submit("nothing to say to this", tx).await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }

        assert!(
            !events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)),
            "stay_silent must not emit TurnComplete; got {events:?}"
        );
        assert!(
            !events.iter().any(|e| matches!(e, AgentEvent::TextComplete(_))),
            "stay_silent must not emit a visible reply"
        );
    }

    // ── Mode is accessible ────────────────────────────────────────────────────

    #[test]
    fn agent_mode_is_accessible() {
        let model = ScriptedMockProvider::always_text("x");
        let agent = agent_with(model, ToolRegistry::default(), AgentConfig::default(), AgentMode::Research);
        assert_eq!(agent.mode(), AgentMode::Research);
    }

    // ── Command vocabulary ────────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_command_resets_store_without_reaching_model() {
        let model = ScriptedMockProvider::always_text("should not be called for /clear");
        let mut agent = default_agent(model);
        let (tx1, rx1) = mpsc::channel(64);
        agent.submit("hello", tx1).await.unwrap();
        let _ = collect_events(rx1).await;
        assert!(!agent.store().is_empty());

        let (tx2, mut rx2) = mpsc::channel(64);
        agent.submit("/clear", tx2).await.unwrap();
        while rx2.try_recv().is_ok() {}

        assert!(agent.store().is_empty(), "/clear must reset the chunk store");
    }

    // ── Branch engine ──────────────────────────────────────────────────────────

    /// A branch spawned via `/pass` runs its own bounded sub-loop and must
    /// not surface the branch-only toolset to the main conversation once it
    /// exits back to ordinary turns.
    #[tokio::test]
    async fn pass_command_opens_and_closes_a_branch() {
        // Branch sub-loop script: inspect one chunk then exit immediately.
        let model = ScriptedMockProvider::new(vec![vec![
            ResponseEvent::ToolCall { index: 0, id: "b1".into(), name: "exit_branch".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]]);
        let mut reg = ToolRegistry::new();
        reg.register(sven_tools::ExitBranchTool);
        let mut agent = agent_with(model, reg, AgentConfig::default(), AgentMode::Agent);
        let (tx, rx) = mpsc::channel(64);

        agent.submit("/pass", tx).await.unwrap();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }

        let opened = events.iter().any(|e| matches!(e, AgentEvent::BranchEvent(m) if m.contains("opened")));
        assert!(opened, "branch must report opening; got {events:?}");

        let exited = events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallFinished { tool_name, is_error, .. } if tool_name == "exit_branch" && !is_error));
        assert!(exited, "exit_branch should have been dispatched and succeeded");
    }

    /// When the branch never calls `exit_branch`, the bounded loop must
    /// force-close it rather than hang the parent turn forever.
    #[tokio::test]
    async fn branch_force_closed_when_iteration_budget_exhausted() {
        // Always stage a harmless removal and never exit — forces the
        // 10-iteration ceiling in `run_branch_loop`.
        let scripts: Vec<Vec<ResponseEvent>> = (0..12)
            .map(|_| {
                vec![
                    ResponseEvent::ToolCall {
                        index: 0,
                        id: "r1".into(),
                        name: "remove_chunks".into(),
                        arguments: r#"{"indices":[0]}"#.into(),
                    },
                    ResponseEvent::Done,
                ]
            })
            .collect();
        let model = ScriptedMockProvider::new(scripts);
        let mut reg = ToolRegistry::new();
        reg.register(sven_tools::RemoveChunksTool);
        let mut agent = agent_with(model, reg, AgentConfig::default(), AgentMode::Agent);
        let (tx, rx) = mpsc::channel(128);

        agent.submit("/pass", tx).await.unwrap();
        let events = collect_events_until_idle(rx).await;

        let force_closed = events
            .iter()
            .any(|e| matches!(e, AgentEvent::BranchEvent(m) if m.contains("iteration budget exhausted")));
        assert!(force_closed, "branch must be force-closed once its iteration budget runs out; got {events:?}");
    }

    async fn collect_events_until_idle(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
                Ok(Some(ev)) => events.push(ev),
                _ => break,
            }
        }
        events
    }

    /// Auto-branching kicks in once the configured turn trigger is reached,
    /// without the operator ever typing `/pass`.
    #[tokio::test]
    async fn auto_branch_triggers_after_configured_turn_count() {
        let scripts = vec![
            vec![ResponseEvent::TextDelta("ok1".into()), ResponseEvent::Done],
            vec![
                ResponseEvent::ToolCall { index: 0, id: "b1".into(), name: "exit_branch".into(), arguments: "{}".into() },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("ok2".into()), ResponseEvent::Done],
        ];
        let model = ScriptedMockProvider::new(scripts);
        let config = AgentConfig { branch_turn_trigger: 1, ..AgentConfig::default() };
        let mut reg = ToolRegistry::new();
        reg.register(sven_tools::ExitBranchTool);
        let mut agent = agent_with(model, reg, config, AgentMode::Agent);

        let (tx1, rx1) = mpsc::channel(64);
        agent.submit("first turn", tx1).await.unwrap();
        let _ = collect_events(rx1).await;

        // Second submit: user_turn_count is now >= branch_turn_trigger, so
        // maybe_auto_branch must fire before the turn itself streams.
        let (tx2, rx2) = mpsc::channel(64);
        agent.submit("second turn", tx2).await.unwrap();
        let events = collect_events(rx2).await;

        let opened = events.iter().any(|e| matches!(e, AgentEvent::BranchEvent(m) if m.contains("opened (auto")));
        assert!(opened, "auto branch trigger must fire on/after the configured turn count; got {events:?}");
    }
}
