// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use futures::StreamExt;
use sven_memory::RecallEngine;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use sven_config::{AgentConfig, AgentMode, MemoryConfig};
use sven_model::{CompletionRequest, Message, ResponseEvent};
use sven_tools::{events::ToolEvent, ToolCall, ToolOutput, ToolRegistry};

use crate::{
    branch::{BranchEngine, BranchOp, BranchTrigger},
    chunk::{ChunkKind, ChunkStore, ToolCallRecord},
    events::{AgentEvent, TurnState},
    prompts::system_prompt,
    runtime_context::AgentRuntimeContext,
    session_manager::SessionManager,
};

/// Name of the distinguished tool call that tells the Turn Engine to discard
/// any visible reply for this turn.
const STAY_SILENT_TOOL: &str = "stay_silent";

/// Error-prefix strings that mark a tool_result as failed even when the
/// underlying handler didn't set `ToolOutput::is_error`.
const ERROR_PREFIXES: &[&str] = &["Error:", "Failed", "错误:", "失败:"];

/// The recent-conversation window (bytes) fed to the Recall Engine alongside
/// the new query, per the Turn Engine's recall step.
const RECALL_CONTEXT_WINDOW_BYTES: usize = 16 * 1024;

/// The core agent. Owns a [`ChunkStore`] and drives the Turn Engine loop
/// described in the kernel's turn algorithm: recall tick/retrieve, stream,
/// dispatch tool calls, persist.
pub struct Agent {
    store: ChunkStore,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<AgentConfig>,
    memory_config: MemoryConfig,
    runtime: AgentRuntimeContext,
    current_mode: Arc<Mutex<AgentMode>>,
    tool_event_rx: mpsc::Receiver<ToolEvent>,
    recall: RecallEngine,
    branches: BranchEngine,
    sessions: Option<Arc<SessionManager>>,
    session_id: String,
    workspace: String,
    user_turn_count: usize,
    max_tokens: usize,
    shell_pid: Option<u32>,
}

impl Agent {
    /// Construct an agent over a fresh chunk store.
    ///
    /// `mode_lock` must be the **same** `Arc` given to any `SwitchModeTool`
    /// in `tools`. `tool_event_rx` must be the receiving end of the channel
    /// whose sender was given to `TodoWriteTool` / `SwitchModeTool`.
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        memory_config: MemoryConfig,
        runtime: AgentRuntimeContext,
        mode_lock: Arc<Mutex<AgentMode>>,
        tool_event_rx: mpsc::Receiver<ToolEvent>,
        recall: RecallEngine,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            store: ChunkStore::new(),
            tools,
            model,
            config,
            memory_config,
            runtime,
            current_mode: mode_lock,
            tool_event_rx,
            recall,
            branches: BranchEngine::new(),
            sessions: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            workspace: String::new(),
            user_turn_count: 0,
            max_tokens: max_context_tokens,
            shell_pid: None,
        }
    }

    /// Attach a Session Manager and workspace label so turns are persisted
    /// automatically at the end of step 6 of the turn algorithm.
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>, workspace: impl Into<String>) -> Self {
        self.sessions = Some(sessions);
        self.workspace = workspace.into();
        self
    }

    /// Resume from a restored chunk store (from [`SessionManager::load`]).
    pub fn resume(mut self, store: ChunkStore, session_id: String) -> Self {
        self.store = store;
        self.session_id = session_id;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> AgentMode {
        *self.current_mode.blocking_lock()
    }

    pub async fn set_mode(&self, mode: AgentMode) {
        *self.current_mode.lock().await = mode;
    }

    pub fn set_model(&mut self, model: Arc<dyn sven_model::ModelProvider>) {
        if let Some(cw) = model.catalog_context_window() {
            self.max_tokens = cw as usize;
        }
        self.model = model;
    }

    // ── Turn Engine entry point (§4.6) ────────────────────────────────────

    /// Process one line of raw operator input: either a command (handled
    /// synchronously, never reaching the LLM) or a user turn.
    pub async fn submit(&mut self, raw_input: &str, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        self.submit_with_cancel(raw_input, tx, None).await
    }

    /// Like [`submit`] but accepts an optional cancel signal. When the
    /// oneshot resolves (or its sender is dropped), the in-flight stream is
    /// interrupted at the next fragment boundary.
    pub async fn submit_with_cancel(
        &mut self,
        raw_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let mut cancel = cancel;

        if let Some(outcome) = self.handle_command(raw_input, &tx).await {
            outcome?;
            return Ok(());
        }
        let user_text = self.normalize_empty_input(raw_input);

        self.maybe_auto_branch(&tx).await;

        self.store.append(ChunkKind::User, user_text.clone());
        self.user_turn_count += 1;

        let forgotten = self.recall.tick();
        for f in &forgotten {
            tracing::trace!(hash = %f.hash, "recall entry forgotten");
        }
        let recall_window = self.recent_text_window(RECALL_CONTEXT_WINDOW_BYTES);
        self.recall
            .recall(&user_text, self.memory_config.active_capacity, Some(&recall_window))
            .await;
        let prelude = self.recall.render_active();

        let outcome = self.run_inner_loop(&tx, prelude, &mut cancel).await;

        match &outcome {
            Ok(TurnOutcome::StaySilent) | Ok(TurnOutcome::Done { .. }) => {
                let final_text = match &outcome {
                    Ok(TurnOutcome::Done { text }) => text.clone(),
                    _ => String::new(),
                };
                if !matches!(outcome, Ok(TurnOutcome::StaySilent)) {
                    self.recall.save(&user_text, &final_text).await;
                }
                self.persist_session();
            }
            Ok(TurnOutcome::Stopped { .. }) | Ok(TurnOutcome::Empty) | Err(_) => {
                self.persist_session();
            }
        }

        outcome.map(|_| ())
    }

    /// Empty input is special-cased: wake the model on an empty conversation,
    /// otherwise inject a short continue marker so the turn is well-formed.
    fn normalize_empty_input(&mut self, raw_input: &str) -> String {
        if !raw_input.trim().is_empty() {
            return raw_input.to_string();
        }
        if self.store.is_empty() {
            self.store.append(ChunkKind::System, "The operator has started a new session with no input. Greet them briefly and ask what they'd like help with.");
        }
        "(continue)".to_string()
    }

    /// Concatenate the last `max_bytes` of conversation text, for recall
    /// query contextualisation.
    fn recent_text_window(&self, max_bytes: usize) -> String {
        let mut parts = Vec::new();
        let mut total = 0usize;
        for chunk in self.store.chunks().iter().rev() {
            if matches!(chunk.kind, ChunkKind::User | ChunkKind::Assistant) {
                total += chunk.content.len();
                parts.push(chunk.content.clone());
                if total >= max_bytes {
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("\n")
    }

    /// §4.6.2: spawn an Auto branch before the turn if no branch is active
    /// and either trigger condition holds.
    async fn maybe_auto_branch(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        if self.branches.is_active() {
            return;
        }
        let token_trigger = self.store.token_total() >= self.config.branch_token_trigger;
        let turn_trigger = self.user_turn_count >= self.config.branch_turn_trigger as usize;
        if !(token_trigger || turn_trigger) {
            return;
        }
        self.spawn_branch(BranchTrigger::Auto, tx).await;
    }

    async fn spawn_branch(&mut self, trigger: BranchTrigger, tx: &mpsc::Sender<AgentEvent>) {
        let overview = BranchEngine::chunk_overview(&self.store);
        let parent_prompt = self.store.chunks().iter().find(|c| c.kind == ChunkKind::System).map(|c| c.content.clone()).unwrap_or_default();
        let skills_blurb = self
            .runtime
            .skills
            .get()
            .iter()
            .map(|s| s.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        let seed = format!(
            "{parent_prompt}\n\n--- BRANCH MODE ---\nYou are a branch of the main agent. Your job is to \
             analyze the parent conversation below, and edit it using the branch toolset: \
             view_chunk_detail, compress_chunks, remove_chunks, rewrite_chunk, preview_changes, \
             commit_changes, rollback_changes, exit_branch. Edits are staged until you call \
             commit_changes. Call exit_branch only after committing or rolling back.\n\n\
             Available skills: {skills_blurb}\n\n--- PARENT CHUNK OVERVIEW ---\n{overview}"
        );
        let expanded_budget = (self.max_tokens as f32 * self.config.branch_budget_multiplier) as usize;
        if self.branches.create(&self.store, trigger, seed, expanded_budget).is_err() {
            return;
        }
        let _ = tx.send(AgentEvent::BranchEvent(format!("branch opened ({trigger})"))).await;
        self.run_branch_loop(tx).await;
    }

    /// Tool names reachable while a branch is active — everything else is
    /// hidden from the schema sent to the model for the branch's lifetime.
    const BRANCH_TOOLSET: &'static [&'static str] = &[
        "view_chunk_detail",
        "compress_chunks",
        "remove_chunks",
        "rewrite_chunk",
        "preview_changes",
        "commit_changes",
        "rollback_changes",
        "exit_branch",
    ];

    /// §4.8 step 3: a bounded Turn-Engine-style loop over the branch's own
    /// chunk store, restricted to [`Self::BRANCH_TOOLSET`]. Runs to
    /// completion (the branch calling `exit_branch`) or until the iteration
    /// budget is exhausted, in which case any pending ops are rolled back
    /// and the branch is force-closed so the parent never stalls on a branch
    /// that never finishes.
    async fn run_branch_loop(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        const MAX_BRANCH_ITERATIONS: u32 = 10;

        for _ in 0..MAX_BRANCH_ITERATIONS {
            if !self.branches.is_active() {
                return;
            }
            let messages = self.branches.active().expect("checked above").store.render_for_llm();
            let mode = *self.current_mode.lock().await;
            let mut no_cancel = None;
            let stream_result = self.stream_turn(messages, mode, &mut no_cancel, tx, true).await;
            let (text, tool_calls, _cancelled) = match stream_result {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "branch turn failed");
                    break;
                }
            };
            if !text.is_empty() {
                let _ = tx.send(AgentEvent::TextDelta(text.clone())).await;
            }
            if tool_calls.is_empty() {
                // Branch produced plain text with no action; it has nothing
                // left to do, so close it out rather than spin.
                break;
            }

            let records: Vec<ToolCallRecord> = tool_calls
                .iter()
                .map(|tc| ToolCallRecord { id: tc.id.clone(), name: tc.name.clone(), arguments_text: tc.args.to_string() })
                .collect();
            if let Some(branch) = self.branches.active_mut() {
                branch.store.append_assistant(text, records);
            }

            let exited = self.dispatch_branch_tool_calls(&tool_calls, tx).await;
            if exited {
                return;
            }
        }

        if self.branches.is_active() {
            if let Some(branch) = self.branches.active_mut() {
                if !branch.pending_ops().is_empty() {
                    branch.rollback();
                }
            }
            let _ = self.branches.exit();
            let _ = tx.send(AgentEvent::BranchEvent("branch closed (iteration budget exhausted)".to_string())).await;
        }
    }

    /// Dispatch one round of branch tool calls, recording each result into
    /// the branch's own chunk store. Returns `true` once `exit_branch` has
    /// succeeded (the branch is no longer active after this call).
    async fn dispatch_branch_tool_calls(&mut self, calls: &[ToolCall], tx: &mpsc::Sender<AgentEvent>) -> bool {
        let mut exited = false;
        for call in calls {
            let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;
            let output = self.execute_branch_tool(call);
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: output.content.clone(),
                    is_error: output.is_error,
                })
                .await;
            if let Some(branch) = self.branches.active_mut() {
                branch.store.append_tool_result(&call.id, &call.name, &output.content, 0);
            }
            if call.name == "exit_branch" && !output.is_error {
                exited = true;
            }
        }
        exited
    }

    /// The actual branch-toolset semantics (§4.8 steps 4-8), executed
    /// directly against `self.branches`/`self.store` rather than through the
    /// tool registry: the registry only carries these tools' schemas so the
    /// model can see them while a branch is active.
    fn execute_branch_tool(&mut self, call: &ToolCall) -> ToolOutput {
        match call.name.as_str() {
            "view_chunk_detail" => {
                let Some(index) = call.args.get("index").and_then(|v| v.as_u64()) else {
                    return ToolOutput::err(&call.id, "usage: view_chunk_detail(index)");
                };
                let Some(branch) = self.branches.active() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                match branch.parent_snapshot().chunks().get(index as usize) {
                    Some(chunk) => ToolOutput::ok(&call.id, format!("#{index} {:?} ({} tok):\n{}", chunk.kind, chunk.tokens_estimate, chunk.content)),
                    None => ToolOutput::err(&call.id, format!("chunk index {index} out of range")),
                }
            }
            "compress_chunks" => {
                let (Some(start), Some(end), Some(summary)) = (
                    call.args.get("start").and_then(|v| v.as_u64()),
                    call.args.get("end").and_then(|v| v.as_u64()),
                    call.args.get("summary").and_then(|v| v.as_str()),
                ) else {
                    return ToolOutput::err(&call.id, "usage: compress_chunks(start, end, summary)");
                };
                let Some(branch) = self.branches.active_mut() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                match branch.stage(BranchOp::Compress { start: start as usize, end: end as usize, summary: summary.to_string() }) {
                    Ok(()) => ToolOutput::ok(&call.id, format!("staged compress #{start}..=#{end}")),
                    Err(e) => ToolOutput::err(&call.id, e.to_string()),
                }
            }
            "remove_chunks" => {
                let Some(indices) = call.args.get("indices").and_then(|v| v.as_array()) else {
                    return ToolOutput::err(&call.id, "usage: remove_chunks(indices)");
                };
                let Some(branch) = self.branches.active_mut() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                let mut staged = 0usize;
                for v in indices {
                    let Some(i) = v.as_u64() else { continue };
                    if branch.stage(BranchOp::Remove { index: i as usize }).is_ok() {
                        staged += 1;
                    }
                }
                ToolOutput::ok(&call.id, format!("staged {staged} removal(s)"))
            }
            "rewrite_chunk" => {
                let (Some(index), Some(new_content)) = (
                    call.args.get("index").and_then(|v| v.as_u64()),
                    call.args.get("new_content").and_then(|v| v.as_str()),
                ) else {
                    return ToolOutput::err(&call.id, "usage: rewrite_chunk(index, new_content)");
                };
                let Some(branch) = self.branches.active_mut() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                match branch.stage(BranchOp::Rewrite { index: index as usize, new_content: new_content.to_string() }) {
                    Ok(()) => ToolOutput::ok(&call.id, format!("staged rewrite #{index}")),
                    Err(e) => ToolOutput::err(&call.id, e.to_string()),
                }
            }
            "preview_changes" => {
                let Some(branch) = self.branches.active() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                match branch.preview(&self.store) {
                    Ok((lines, delta)) => ToolOutput::ok(&call.id, format!("{}\nestimated token delta: {delta:+}", lines.join("\n"))),
                    Err(e) => ToolOutput::err(&call.id, e.to_string()),
                }
            }
            "commit_changes" => {
                let Some(branch) = self.branches.active_mut() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                match branch.commit(&mut self.store) {
                    Ok(n) => ToolOutput::ok(&call.id, format!("committed {n} change(s)")),
                    Err(e) => ToolOutput::err(&call.id, e.to_string()),
                }
            }
            "rollback_changes" => {
                let Some(branch) = self.branches.active_mut() else {
                    return ToolOutput::err(&call.id, "no active branch");
                };
                branch.rollback();
                ToolOutput::ok(&call.id, "pending changes discarded")
            }
            "exit_branch" => match self.branches.exit() {
                Ok(()) => ToolOutput::ok(&call.id, "branch closed"),
                Err(e) => ToolOutput::err(&call.id, e.to_string()),
            },
            other => ToolOutput::err(&call.id, format!("unknown branch tool: {other}")),
        }
    }

    // ── inner loop (§4.6 step 4) ──────────────────────────────────────────

    async fn run_inner_loop(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        mut prelude: Option<String>,
        cancel: &mut Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> anyhow::Result<TurnOutcome> {
        const MAX_EMPTY_TURN_RETRIES: u32 = 2;

        let _ = tx.send(AgentEvent::TurnState(TurnState::Streaming)).await;
        let mut iteration = 0u32;
        let mut last_text = String::new();
        let mut empty_turn_retries = 0u32;
        let mut tool_call_rounds_this_step = 0u32;
        let mut stall_nudge_sent = false;

        loop {
            iteration += 1;
            if let Some(c) = cancel.as_mut() {
                if c.try_recv().is_ok() {
                    let _ = tx.send(AgentEvent::TurnState(TurnState::Stopped)).await;
                    let _ = tx.send(AgentEvent::Aborted { partial_text: last_text.clone() }).await;
                    return Ok(TurnOutcome::Stopped { partial_text: last_text });
                }
            }

            let over_budget = iteration > self.config.max_tool_rounds;
            if over_budget {
                let nudge = format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools. \
                     Write a concise summary of: (1) what has been completed, \
                     (2) what still remains to be done, and (3) how to continue.",
                    self.config.max_tool_rounds
                );
                self.store.append(ChunkKind::User, nudge);
            }

            let mode = *self.current_mode.lock().await;
            let messages = self.render_with_prelude(prelude.take());

            let stream_result = self.stream_turn(messages, mode, cancel, tx, !over_budget).await;
            let (text, tool_calls, cancelled) = match stream_result {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                    return Err(e);
                }
            };
            if cancelled {
                let _ = tx.send(AgentEvent::TurnState(TurnState::Stopped)).await;
                let _ = tx.send(AgentEvent::Aborted { partial_text: text.clone() }).await;
                return Ok(TurnOutcome::Stopped { partial_text: text });
            }

            for delta in text_deltas(&text) {
                let _ = tx.send(AgentEvent::TextDelta(delta)).await;
            }
            if !text.is_empty() {
                let _ = tx.send(AgentEvent::TextComplete(text.clone())).await;
            }

            if tool_calls.is_empty() {
                if text.is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    self.store.append(
                        ChunkKind::User,
                        "You produced a thinking block but no response or tool call. \
                         Please continue with your next action.",
                    );
                    continue;
                }
                if !text.is_empty() && text_contains_malformed_tool_call(&text) && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    self.store.append(
                        ChunkKind::User,
                        "You output a tool call using an incorrect format (XML/function tags \
                         in the text response). Do not include tool calls in your text. \
                         Use the JSON tool-call protocol provided by your schema.",
                    );
                    continue;
                }
                // Reasoning models occasionally emit a transition sentence after
                // several tool-call rounds without following up. Nudge once,
                // but never twice, so an obedient model isn't looped forever.
                if !text.is_empty() && tool_call_rounds_this_step >= 2 && !stall_nudge_sent {
                    stall_nudge_sent = true;
                    self.store.append(
                        ChunkKind::User,
                        "You have not finished the task yet. Please continue with your next tool call.",
                    );
                    continue;
                }
                if text.is_empty() {
                    let _ = tx.send(AgentEvent::TurnState(TurnState::Empty)).await;
                    return Ok(TurnOutcome::Empty);
                }
            }
            empty_turn_retries = 0;

            let stay_silent = tool_calls.iter().any(|tc| tc.name == STAY_SILENT_TOOL);
            let (content, records, dispatch_calls) = if stay_silent {
                (String::new(), Vec::new(), Vec::new())
            } else {
                let records: Vec<ToolCallRecord> = tool_calls
                    .iter()
                    .map(|tc| ToolCallRecord { id: tc.id.clone(), name: tc.name.clone(), arguments_text: tc.args.to_string() })
                    .collect();
                (text.clone(), records, tool_calls.clone())
            };
            last_text = if stay_silent { last_text } else { content.clone() };

            if stay_silent {
                self.store.append_assistant(
                    String::new(),
                    vec![ToolCallRecord { id: "stay_silent".into(), name: STAY_SILENT_TOOL.into(), arguments_text: "{}".into() }],
                );
            } else {
                self.store.append_assistant(content.clone(), records);
            }

            if stay_silent {
                let _ = tx.send(AgentEvent::TurnState(TurnState::Done)).await;
                return Ok(TurnOutcome::StaySilent);
            }

            if dispatch_calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnState(TurnState::Done)).await;
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(TurnOutcome::Done { text: last_text });
            }

            tool_call_rounds_this_step += 1;
            let _ = tx.send(AgentEvent::TurnState(TurnState::Dispatching)).await;
            self.dispatch_tool_calls(&dispatch_calls, tx).await;
        }
    }

    /// Render the chunk store for the LLM, prepending a transient recall
    /// prelude message (never persisted to the store) on the first
    /// iteration only.
    fn render_with_prelude(&self, prelude: Option<String>) -> Vec<Message> {
        let mut messages = self.store.render_for_llm();
        if let Some(digest) = prelude {
            messages.push(Message::assistant(digest));
        }
        messages
    }

    /// Dispatch every tool call in order (§4.6 step 4.6/4.7): parse args,
    /// repair-on-failure, execute, append tool_result, refresh the shell
    /// chunk when the tool is shell-category.
    async fn dispatch_tool_calls(&mut self, calls: &[ToolCall], tx: &mpsc::Sender<AgentEvent>) {
        for call in calls {
            let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;

            let output = self.tools.execute(call).await;
            self.drain_tool_events(tx).await;

            let is_error = output.is_error || ERROR_PREFIXES.iter().any(|p| output.content.starts_with(p));
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: output.content.clone(),
                    is_error,
                })
                .await;

            let tool = self.tools.get(&call.name);
            let max_call_pairs = tool.as_ref().map(|t| t.retention().as_max_call_pairs()).unwrap_or(0);
            let singleton_key = tool.as_ref().and_then(|t| t.singleton_key(call, &output));
            let stored_content = tool.as_ref().map(|t| t.result_transform(call, &output)).unwrap_or_else(|| output.content.clone());
            self.store
                .append_tool_result_keyed(&call.id, &call.name, stored_content, max_call_pairs, singleton_key);

            let category = tool.as_ref().map(|t| t.category().to_string()).unwrap_or_default();
            if category == "shell" {
                let _ = tx.send(AgentEvent::ShellSnapshot(output.content.clone())).await;
                self.store.upsert_shell(output.content.clone(), true);
            }
        }
    }

    /// Call the model once, accumulating streamed text and tool calls.
    /// Returns `(text, tool_calls, cancelled)`.
    async fn stream_turn(
        &mut self,
        messages: Vec<Message>,
        mode: AgentMode,
        cancel: &mut Option<tokio::sync::oneshot::Receiver<()>>,
        tx: &mpsc::Sender<AgentEvent>,
        allow_tools: bool,
    ) -> anyhow::Result<(String, Vec<ToolCall>, bool)> {
        let branch_active = self.branches.is_active();
        let tool_schemas: Vec<sven_model::ToolSchema> = if !allow_tools {
            Vec::new()
        } else {
            self.tools
                .get_enabled_schemas(mode)
                .into_iter()
                .filter(|s| Self::BRANCH_TOOLSET.contains(&s.name.as_str()) == branch_active)
                .map(|s| sven_model::ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
                .collect()
        };

        let modalities = self.model.input_modalities();
        let messages = sven_model::sanitize::strip_images_if_unsupported(messages, &modalities);

        let req = CompletionRequest {
            messages,
            tools: tool_schemas,
            stream: true,
            system_dynamic_suffix: self.dynamic_context(),
            cache_key: Some(self.session_id.clone()),
        };

        let mut stream = self.model.complete(req).await.map_err(|e| {
            if let Some(n_ctx) = extract_n_ctx_from_error(&e) {
                warn!(n_ctx, "context overflow reported by provider");
                self.max_tokens = n_ctx;
            }
            e
        })?;

        let mut full_text = String::new();
        // Keyed by the tool call's own id (providers that split one call
        // across several deltas repeat the id on every delta); calls that
        // arrive with no id at all get a synthetic per-stream key so their
        // argument fragments don't collide.
        let mut pending_tcs: Vec<(String, PendingToolCall)> = Vec::new();
        let mut unidentified_calls = 0u32;
        let mut thinking_buf = String::new();
        let mut cancelled = false;

        loop {
            let next = if let Some(c) = cancel.as_mut() {
                tokio::select! {
                    biased;
                    _ = c => { cancelled = true; None }
                    event = stream.next() => event,
                }
            } else {
                stream.next().await
            };
            let Some(event) = next else { break };
            if cancelled {
                break;
            }

            match event? {
                ResponseEvent::ThinkingDelta(delta) => {
                    thinking_buf.push_str(&delta);
                    let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                }
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if !thinking_buf.is_empty() {
                        let content = std::mem::take(&mut thinking_buf);
                        let _ = tx.send(AgentEvent::ThinkingComplete(strip_think_wrappers(content))).await;
                    }
                    full_text.push_str(&delta);
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCall { id, name, arguments } => {
                    let key = if id.is_empty() {
                        unidentified_calls += 1;
                        format!("__unidentified_{unidentified_calls}")
                    } else {
                        id.clone()
                    };
                    let slot = pending_tcs.iter_mut().find(|(k, _)| *k == key);
                    match slot {
                        Some((_, ptc)) => {
                            if !name.is_empty() {
                                ptc.name = name;
                            }
                            ptc.args_buf.push_str(&arguments);
                        }
                        None => {
                            pending_tcs.push((
                                key,
                                PendingToolCall { id, name, args_buf: arguments },
                            ));
                        }
                    }
                }
                ResponseEvent::Usage { .. } => {}
                ResponseEvent::Done => {
                    if !thinking_buf.is_empty() {
                        let content = std::mem::take(&mut thinking_buf);
                        let _ = tx.send(AgentEvent::ThinkingComplete(strip_think_wrappers(content))).await;
                    }
                    break;
                }
                ResponseEvent::Error(e) => warn!("model stream error: {e}"),
            }
        }

        if !full_text.is_empty() && thinking_buf.is_empty() {
            if let Some(inline) = extract_inline_think_block(&full_text) {
                let _ = tx.send(AgentEvent::ThinkingComplete(inline)).await;
                full_text.clear();
            }
        }

        let mut tool_calls = Vec::with_capacity(pending_tcs.len());
        for (i, (_, ptc)) in pending_tcs.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model; cannot dispatch");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
            tool_calls.push(tc);
        }

        Ok((full_text, tool_calls, cancelled))
    }

    async fn drain_tool_events(&mut self, _tx: &mpsc::Sender<AgentEvent>) {
        while let Ok(te) = self.tool_event_rx.try_recv() {
            if let ToolEvent::ModeChanged(new_mode) = te {
                *self.current_mode.lock().await = new_mode;
            }
        }
    }

    fn persist_session(&self) {
        let Some(sessions) = &self.sessions else { return };
        let model_name = self.model.model_name().to_string();
        let shell_open = self.store.chunks().iter().any(|c| c.kind == ChunkKind::Shell);
        if let Err(e) = sessions.save(&self.store, &self.workspace, &model_name, shell_open, self.shell_pid, Some(self.session_id.clone())) {
            warn!(error = %e, "session persistence failed");
        }
    }

    fn system_message(&self, mode: AgentMode) -> Message {
        let ctx = self.prompt_context();
        let stable_ctx = ctx.stable_only();
        let custom = self.runtime.system_prompt_override.as_deref().or(self.config.system_prompt.as_deref());
        Message::system(system_prompt(mode, custom, stable_ctx))
    }

    fn prompt_context(&self) -> crate::prompts::PromptContext<'_> {
        crate::prompts::PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
            skills: self.runtime.skills.get(),
            agents: self.runtime.agents.get(),
            knowledge: self.runtime.knowledge.get(),
            knowledge_drift_note: self.runtime.knowledge_drift_note.as_deref(),
        }
    }

    fn dynamic_context(&self) -> Option<String> {
        if self.runtime.system_prompt_override.is_some() || self.config.system_prompt.is_some() {
            return None;
        }
        self.prompt_context().dynamic_block()
    }

    /// Ensure the store carries a system chunk, using the given mode.
    /// Called once at session start (first submit on an empty store).
    pub fn ensure_system_chunk(&mut self, mode: AgentMode) {
        if !self.store.chunks().iter().any(|c| c.kind == ChunkKind::System) {
            let msg = self.system_message(mode);
            if let Some(text) = msg.as_text() {
                self.store.append(ChunkKind::System, text.to_string());
            }
        }
    }

    // ── §4.6.1 command vocabulary ──────────────────────────────────────────

    /// Dispatch recognised `/...` commands and `exit|quit|bye` synchronously.
    /// Returns `None` when `raw_input` is not a recognised command (the
    /// caller should proceed with a normal turn).
    async fn handle_command(&mut self, raw_input: &str, tx: &mpsc::Sender<AgentEvent>) -> Option<anyhow::Result<()>> {
        let trimmed = raw_input.trim();
        if matches!(trimmed, "exit" | "quit" | "bye") {
            return Some(Ok(()));
        }
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or("");
        let arg = parts.next().unwrap_or("").trim();

        let reply = match cmd {
            "/clear" | "/new" => {
                self.store = ChunkStore::new();
                self.user_turn_count = 0;
                "Started a new conversation.".to_string()
            }
            "/chunks" => self
                .store
                .list_chunks()
                .iter()
                .map(|(id, kind, preview, tokens)| format!("{id} {kind:?} ({tokens} tok): {preview}"))
                .collect::<Vec<_>>()
                .join("\n"),
            "/model" => {
                if arg.is_empty() {
                    self.model.model_name().to_string()
                } else {
                    format!("model override requested: {arg} (apply via composition root)")
                }
            }
            "/messages" => format!("{} chunks, {} tokens", self.store.len(), self.store.token_total()),
            "/edit" => {
                let mut bits = arg.splitn(2, char::is_whitespace);
                match (bits.next(), bits.next()) {
                    (Some(id), Some(content)) => match self.store.edit(id, content.to_string()) {
                        Ok(()) => "edited".to_string(),
                        Err(e) => format!("edit failed: {e}"),
                    },
                    _ => "usage: /edit <chunk-id> <new content>".to_string(),
                }
            }
            "/memory" if arg == "edit" => "usage: /memory edit <text>".to_string(),
            "/memory" => self.recall.render_active().unwrap_or_else(|| "(no active memories)".to_string()),
            "/sessions" => match &self.sessions {
                Some(s) => s
                    .list(20)
                    .iter()
                    .map(|s| format!("{} {} ({} msgs)", s.id, s.title, s.message_count))
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => "no session manager configured".to_string(),
            },
            "/load" => match (&self.sessions, arg.is_empty()) {
                (Some(s), false) => match s.load(arg) {
                    Some(restored) => {
                        self.store = restored.store;
                        self.session_id = restored.session_id;
                        self.workspace = restored.workspace_dir;
                        "session loaded".to_string()
                    }
                    None => format!("no such session: {arg}"),
                },
                _ => "usage: /load <session-id>".to_string(),
            },
            "/delete-session" => match (&self.sessions, arg.is_empty()) {
                (Some(s), false) => match s.delete(arg) {
                    Ok(()) => "session deleted".to_string(),
                    Err(e) => format!("delete failed: {e}"),
                },
                _ => "usage: /delete-session <session-id>".to_string(),
            },
            "/context" | "/ctx" if arg != "stats" => {
                format!("context: {:.1}% used ({}/{} tokens)", self.store.context_fraction(self.max_tokens) * 100.0, self.store.token_total(), self.max_tokens)
            }
            "/context" | "/ctx" => format!(
                "chunks={} tokens={} max={} branch_active={}",
                self.store.len(),
                self.store.token_total(),
                self.max_tokens,
                self.branches.is_active()
            ),
            "/pass" => {
                self.spawn_branch(BranchTrigger::Manual, tx).await;
                "branch requested".to_string()
            }
            "/stop" => "nothing to stop".to_string(),
            _ => format!(
                "unknown command {cmd}. Available: /clear /chunks /model /messages /edit /memory \
                 /memory edit /sessions /load <id> /delete-session <id> /new /context /ctx \
                 /context stats /pass /stop exit quit bye"
            ),
        };
        let _ = tx.send(AgentEvent::TextComplete(reply)).await;
        Some(Ok(()))
    }
}

enum TurnOutcome {
    Done { text: String },
    StaySilent,
    Stopped { partial_text: String },
    Empty,
}

fn text_deltas(text: &str) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![text.to_string()]
    }
}

/// Try to extract `n_ctx` from a context-overflow API error.
///
/// llama.cpp-compatible backends return a structured error body when the
/// request exceeds the loaded context window:
///
/// ```json
/// {"error":{"type":"exceed_context_size_error","n_ctx":54272,"n_prompt_tokens":54298,...}}
/// ```
fn extract_n_ctx_from_error(err: &anyhow::Error) -> Option<usize> {
    let msg = err.to_string();
    if !msg.contains("exceed_context_size_error") {
        return None;
    }
    let json_start = msg.find('{')?;
    let body: serde_json::Value = serde_json::from_str(&msg[json_start..]).ok()?;
    if let Some(n) = body["error"]["n_ctx"].as_u64() {
        return Some(n as usize);
    }
    body["n_ctx"].as_u64().map(|n| n as usize)
}

/// Detect tool-call markup the model wrote into the text stream instead of
/// emitting as a structured tool call (Qwen XML, Hermes function tags, and
/// similar fine-tune artifacts that slip past the provider's protocol).
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}

/// Strip a surrounding `<think>...</think>` wrapper some model servers
/// forget to remove from `reasoning_content` before it reaches us.
fn strip_think_wrappers(s: String) -> String {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<think>").unwrap_or(trimmed);
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    inner.trim().to_string()
}

/// Detect a `<think>...</think>` block occupying the *entire* text.
fn extract_inline_think_block(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("<think>")?;
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    if inner.contains("</think>") {
        return None;
    }
    Some(inner.trim().to_string())
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated argument buffer to a JSON object, attempting a
    /// best-effort repair on parse failure. Always resolves to an object —
    /// model providers require tool_use input to be an object, and sending
    /// `null` would surface as a 400 on the *next* completion request.
    fn finish(self) -> ToolCall {
        let args = if self.args_buf.trim().is_empty() {
            warn!(tool_name = %self.name, tool_call_id = %self.id, "model sent tool call with empty arguments; substituting {{}}");
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Ok(v) => {
                        warn!(tool_name = %self.name, tool_call_id = %self.id, "repaired invalid JSON arguments from model");
                        v
                    }
                    Err(_) => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            args_buf = %self.args_buf,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall { id: self.id, name: self.name, args }
    }
}

/// Attempt to repair common JSON syntax errors in tool-call arguments:
/// invalid escape sequences, bare scalar values needing quotes, and
/// truncated trailing braces.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    let single_quoted = fixed.replace('\'', "\"");
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&single_quoted) {
        return Ok(v);
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Replace invalid JSON escape sequences (`\c`, `\p`, …) inside string
/// values with a properly escaped backslash so the result round-trips
/// through `serde_json`.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
