// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The chunk store: the single source of truth for a conversation.
//!
//! A [`ChunkStore`] is an ordered log of typed [`Chunk`]s. Unlike
//! [`crate::session::Session`]'s flat message list, each chunk carries a
//! kind tag and kind-specific metadata, and the store enforces a handful of
//! structural invariants (singleton `shell`/`memory` chunks, tool-call/
//! tool-result pairing) on every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sven_model::{FunctionCall, Message, MessageContent, Role};
use uuid::Uuid;

/// The tag distinguishing what a chunk represents in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    System,
    Memory,
    User,
    Assistant,
    Thought,
    ToolCall,
    ToolResult,
    Shell,
}

/// A single tool-call record carried by an `assistant` chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments_text: String,
}

/// Kind-specific metadata. Untagged so existing serialized chunks without
/// metadata still deserialize as `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Set on `assistant` chunks that requested tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    /// Set on `tool_result` chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_hint: Option<String>,
    /// Set on `tool_result` chunks whose tool provided a
    /// [`sven_tools::Tool::singleton_key`]; a later chunk sharing the same
    /// `(tool_name, singleton_key)` pair displaces this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
}

impl ChunkMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_none()
            && self.tool_call_id.is_none()
            && self.tool_name.is_none()
            && self.display_hint.is_none()
            && self.singleton_key.is_none()
    }
}

/// The atomic, typed unit of conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub kind: ChunkKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub tokens_estimate: usize,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// 4 chars/token heuristic, matching [`sven_model::Message::approx_tokens`].
fn estimate_tokens(content: &str) -> usize {
    (content.len() / 4).max(1)
}

impl Chunk {
    fn new(kind: ChunkKind, content: impl Into<String>, metadata: ChunkMetadata) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            tokens_estimate: estimate_tokens(&content),
            kind,
            content,
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn retokenize(&mut self) {
        self.tokens_estimate = estimate_tokens(&self.content);
    }
}

const NEW_TERMINAL_MARKER: &str = "\n\n=== new terminal ===\n";

/// Result of a mutation that can legally no-op or fail with a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOpError {
    /// The target chunk does not exist.
    NotFound,
    /// `system` chunks may not be edited or deleted directly.
    SystemImmutable,
}

impl std::fmt::Display for ChunkOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "chunk not found"),
            Self::SystemImmutable => write!(f, "system chunks cannot be edited or deleted"),
        }
    }
}

impl std::error::Error for ChunkOpError {}

/// Ordered log of chunks, with a cached running token sum.
///
/// Invariants enforced by construction (never by post-hoc validation):
/// (1) at most one `shell` chunk exists at any time; (2) every
/// `tool_result.tool_call_id` matches an id inside some earlier
/// `assistant.tool_calls`; (3) deleting an `assistant` chunk with tool_calls
/// cascades to its matching `tool_result` chunks and vice versa; (4) `system`
/// chunks are never user-editable; (5) rendering coalesces consecutive
/// `system`+`memory` chunks into one system message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    #[serde(skip)]
    token_total: usize,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn token_total(&self) -> usize {
        self.token_total
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.chunks.iter().position(|c| c.id == id)
    }

    fn recalc_token_total(&mut self) {
        self.token_total = self.chunks.iter().map(|c| c.tokens_estimate).sum();
    }

    /// Fraction of `max_tokens` currently used by the store.
    pub fn context_fraction(&self, max_tokens: usize) -> f32 {
        if max_tokens == 0 {
            return 0.0;
        }
        self.token_total as f32 / max_tokens as f32
    }

    // ── append / upsert ───────────────────────────────────────────────────

    /// Append a plain chunk (no retention handling — use [`Self::append_tool_result`]
    /// for `tool_result` chunks that should enforce a `max_call_pairs` policy).
    pub fn append(&mut self, kind: ChunkKind, content: impl Into<String>) -> String {
        self.append_with_metadata(kind, content, ChunkMetadata::default())
    }

    pub fn append_with_metadata(
        &mut self,
        kind: ChunkKind,
        content: impl Into<String>,
        metadata: ChunkMetadata,
    ) -> String {
        let chunk = Chunk::new(kind, content, metadata);
        let id = chunk.id.clone();
        self.token_total += chunk.tokens_estimate;
        self.chunks.push(chunk);
        id
    }

    /// Append an `assistant` chunk, optionally carrying tool_calls.
    pub fn append_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> String {
        let metadata = ChunkMetadata {
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            ..Default::default()
        };
        self.append_with_metadata(ChunkKind::Assistant, content, metadata)
    }

    /// Append a `tool_result` chunk and enforce `max_call_pairs` retention
    /// for `tool_name` if `max_call_pairs > 0`.
    ///
    /// Returns the new chunk's id.
    pub fn append_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        max_call_pairs: usize,
    ) -> String {
        self.append_tool_result_keyed(tool_call_id, tool_name, content, max_call_pairs, None)
    }

    /// Like [`Self::append_tool_result`], but when `singleton_key` is
    /// `Some`, any prior `tool_result` chunk produced by the same
    /// `tool_name` carrying the same key is evicted first so only the
    /// latest one for that key remains.
    pub fn append_tool_result_keyed(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        max_call_pairs: usize,
        singleton_key: Option<String>,
    ) -> String {
        let tool_name = tool_name.into();
        if let Some(key) = &singleton_key {
            let displaced: Vec<String> = self
                .chunks
                .iter()
                .filter(|c| {
                    c.kind == ChunkKind::ToolResult
                        && c.metadata.tool_name.as_deref() == Some(tool_name.as_str())
                        && c.metadata.singleton_key.as_deref() == Some(key.as_str())
                })
                .map(|c| c.id.clone())
                .collect();
            for result_id in displaced {
                self.evict_tool_result_pair(&result_id);
            }
        }
        let metadata = ChunkMetadata {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.clone()),
            singleton_key,
            ..Default::default()
        };
        let id = self.append_with_metadata(ChunkKind::ToolResult, content, metadata);
        if max_call_pairs > 0 {
            self.enforce_retention(&tool_name, max_call_pairs);
        }
        id
    }

    /// Evict the oldest `(tool_call, tool_result)` pairs for `tool_name`
    /// until at most `max_call_pairs` `tool_result` chunks for it remain.
    fn enforce_retention(&mut self, tool_name: &str, max_call_pairs: usize) {
        let result_ids: Vec<String> = self
            .chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::ToolResult && c.metadata.tool_name.as_deref() == Some(tool_name))
            .map(|c| c.id.clone())
            .collect();

        if result_ids.len() <= max_call_pairs {
            return;
        }
        let evict_count = result_ids.len() - max_call_pairs;
        for result_id in result_ids.into_iter().take(evict_count) {
            self.evict_tool_result_pair(&result_id);
        }
    }

    /// Remove a `tool_result` chunk and, if its matching `assistant`
    /// tool_call becomes orphaned, remove the tool_call entry (and the
    /// whole assistant chunk if it becomes empty and content-free).
    fn evict_tool_result_pair(&mut self, result_id: &str) {
        let Some(result_idx) = self.index_of(result_id) else { return };
        let call_id = self.chunks[result_idx].metadata.tool_call_id.clone();
        self.remove_at(result_idx);

        let Some(call_id) = call_id else { return };
        if let Some((assistant_idx, _)) = self
            .chunks
            .iter()
            .enumerate()
            .find(|(_, c)| {
                c.kind == ChunkKind::Assistant
                    && c.metadata
                        .tool_calls
                        .as_ref()
                        .is_some_and(|tcs| tcs.iter().any(|tc| tc.id == call_id))
            })
        {
            let assistant = &mut self.chunks[assistant_idx];
            if let Some(tcs) = &mut assistant.metadata.tool_calls {
                tcs.retain(|tc| tc.id != call_id);
                if tcs.is_empty() {
                    assistant.metadata.tool_calls = None;
                }
            }
            let remove_whole = assistant.content.is_empty() && assistant.metadata.tool_calls.is_none();
            if remove_whole {
                self.remove_at(assistant_idx);
            }
        }
    }

    fn remove_at(&mut self, idx: usize) {
        let removed = self.chunks.remove(idx);
        self.token_total = self.token_total.saturating_sub(removed.tokens_estimate);
    }

    /// Enforce the single-`shell`-chunk invariant.
    ///
    /// If `move_to_end` is false, the existing shell chunk (if any) is
    /// rewritten in place. If true, the existing chunk is dropped and a new
    /// one is appended at the end of the store, with its content prefixed by
    /// the old content and a "new terminal" marker when old content existed.
    pub fn upsert_shell(&mut self, content: impl Into<String>, move_to_end: bool) -> String {
        let content = content.into();
        let existing_idx = self.chunks.iter().position(|c| c.kind == ChunkKind::Shell);

        if !move_to_end {
            if let Some(idx) = existing_idx {
                let chunk = &mut self.chunks[idx];
                self.token_total -= chunk.tokens_estimate;
                chunk.content = content;
                chunk.retokenize();
                self.token_total += chunk.tokens_estimate;
                return chunk.id.clone();
            }
            return self.append(ChunkKind::Shell, content);
        }

        let final_content = if let Some(idx) = existing_idx {
            let old = self.chunks[idx].content.clone();
            self.remove_at(idx);
            if old.is_empty() {
                content
            } else {
                format!("{old}{NEW_TERMINAL_MARKER}{content}")
            }
        } else {
            content
        };
        self.append(ChunkKind::Shell, final_content)
    }

    /// Enforce the single-`memory`-chunk invariant; idempotent on repeated
    /// identical content.
    pub fn upsert_memory(&mut self, content: impl Into<String>) -> String {
        let content = content.into();
        if let Some(idx) = self.chunks.iter().position(|c| c.kind == ChunkKind::Memory) {
            let chunk = &mut self.chunks[idx];
            if chunk.content == content {
                return chunk.id.clone();
            }
            self.token_total -= chunk.tokens_estimate;
            chunk.content = content;
            chunk.retokenize();
            self.token_total += chunk.tokens_estimate;
            return chunk.id.clone();
        }
        self.append(ChunkKind::Memory, content)
    }

    /// Replace the most recent `system` chunk, or append one if none exists.
    pub fn update_system(&mut self, content: impl Into<String>) -> String {
        let content = content.into();
        if let Some(idx) = self.chunks.iter().rposition(|c| c.kind == ChunkKind::System) {
            let chunk = &mut self.chunks[idx];
            self.token_total -= chunk.tokens_estimate;
            chunk.content = content;
            chunk.retokenize();
            self.token_total += chunk.tokens_estimate;
            return chunk.id.clone();
        }
        self.append(ChunkKind::System, content)
    }

    // ── edit / delete / truncate ──────────────────────────────────────────

    pub fn edit(&mut self, id: &str, new_content: impl Into<String>) -> Result<(), ChunkOpError> {
        let idx = self.index_of(id).ok_or(ChunkOpError::NotFound)?;
        if self.chunks[idx].kind == ChunkKind::System {
            return Err(ChunkOpError::SystemImmutable);
        }
        let new_content = new_content.into();
        let chunk = &mut self.chunks[idx];
        self.token_total -= chunk.tokens_estimate;
        chunk.content = new_content;
        chunk.retokenize();
        self.token_total += chunk.tokens_estimate;
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<(), ChunkOpError> {
        let idx = self.index_of(id).ok_or(ChunkOpError::NotFound)?;
        let kind = self.chunks[idx].kind;
        if kind == ChunkKind::System {
            return Err(ChunkOpError::SystemImmutable);
        }
        self.cascade_delete(idx);
        Ok(())
    }

    /// Delete the chunk at `idx`, cascading to its tool_call/tool_result
    /// counterpart per the store's pairing invariant.
    fn cascade_delete(&mut self, idx: usize) {
        let chunk = &self.chunks[idx];
        match chunk.kind {
            ChunkKind::Assistant => {
                let ids: Vec<String> = chunk
                    .metadata
                    .tool_calls
                    .as_ref()
                    .map(|tcs| tcs.iter().map(|tc| tc.id.clone()).collect())
                    .unwrap_or_default();
                self.remove_at(idx);
                for call_id in ids {
                    if let Some(result_idx) = self.chunks.iter().position(|c| {
                        c.kind == ChunkKind::ToolResult && c.metadata.tool_call_id.as_deref() == Some(call_id.as_str())
                    }) {
                        self.remove_at(result_idx);
                    }
                }
            }
            ChunkKind::ToolResult => {
                let call_id = chunk.metadata.tool_call_id.clone();
                self.remove_at(idx);
                if let Some(call_id) = call_id {
                    if let Some((assistant_idx, _)) = self.chunks.iter().enumerate().find(|(_, c)| {
                        c.kind == ChunkKind::Assistant
                            && c.metadata
                                .tool_calls
                                .as_ref()
                                .is_some_and(|tcs| tcs.iter().any(|tc| tc.id == call_id))
                    }) {
                        let assistant = &mut self.chunks[assistant_idx];
                        if let Some(tcs) = &mut assistant.metadata.tool_calls {
                            tcs.retain(|tc| tc.id != call_id);
                            if tcs.is_empty() {
                                assistant.metadata.tool_calls = None;
                            }
                        }
                    }
                }
            }
            _ => self.remove_at(idx),
        }
    }

    /// Delete `id` and every chunk after it, applying cascade semantics.
    pub fn truncate_from(&mut self, id: &str) -> Result<(), ChunkOpError> {
        let idx = self.index_of(id).ok_or(ChunkOpError::NotFound)?;
        if self.chunks[idx].kind == ChunkKind::System {
            return Err(ChunkOpError::SystemImmutable);
        }
        // Remove back-to-front so indices of not-yet-removed chunks stay valid.
        while self.chunks.len() > idx {
            let last = self.chunks.len() - 1;
            self.cascade_delete(last.min(self.chunks.len() - 1));
            if self.chunks.len() <= idx {
                break;
            }
        }
        Ok(())
    }

    // ── rendering ──────────────────────────────────────────────────────────

    /// Render the store into an LLM-facing message sequence.
    ///
    /// `thought` and `tool_call` chunks are representational only and are
    /// skipped; consecutive `system`+`memory` chunks coalesce into one
    /// system message; `shell` chunks render as a user message at their
    /// current position.
    pub fn render_for_llm(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.chunks.len());
        let mut i = 0;
        while i < self.chunks.len() {
            let chunk = &self.chunks[i];
            match chunk.kind {
                ChunkKind::Thought | ChunkKind::ToolCall => {
                    i += 1;
                }
                ChunkKind::System | ChunkKind::Memory => {
                    let mut parts = vec![chunk.content.clone()];
                    let mut j = i + 1;
                    while j < self.chunks.len()
                        && matches!(self.chunks[j].kind, ChunkKind::System | ChunkKind::Memory)
                    {
                        parts.push(self.chunks[j].content.clone());
                        j += 1;
                    }
                    out.push(Message::system(parts.join("\n")));
                    i = j;
                }
                ChunkKind::User => {
                    out.push(Message::user(chunk.content.clone()));
                    i += 1;
                }
                ChunkKind::Assistant => {
                    out.extend(render_assistant(chunk));
                    i += 1;
                }
                ChunkKind::ToolResult => {
                    out.push(Message::tool_result(
                        chunk.metadata.tool_call_id.clone().unwrap_or_default(),
                        chunk.content.clone(),
                    ));
                    i += 1;
                }
                ChunkKind::Shell => {
                    out.push(Message::user(format!(
                        "[current terminal screen]\n{}\n[end terminal screen]",
                        chunk.content
                    )));
                    i += 1;
                }
            }
        }
        out
    }

    // ── serialization ─────────────────────────────────────────────────────

    pub fn serialize(&self) -> Value {
        serde_json::to_value(&self.chunks).unwrap_or(Value::Array(vec![]))
    }

    /// Rebuild a store from serialized chunks, re-estimating tokens for any
    /// chunk whose `tokens_estimate` is missing or stale.
    pub fn deserialize(value: Value) -> anyhow::Result<Self> {
        let mut chunks: Vec<Chunk> = serde_json::from_value(value)?;
        for c in &mut chunks {
            if c.tokens_estimate == 0 {
                c.retokenize();
            }
        }
        let mut store = Self { chunks, token_total: 0 };
        store.recalc_token_total();
        Ok(store)
    }

    // ── command-vocabulary helpers (§4.1.1) ───────────────────────────────

    pub fn list_chunks(&self) -> Vec<(String, ChunkKind, String, usize)> {
        self.chunks
            .iter()
            .map(|c| (c.id.clone(), c.kind, preview(&c.content, 60), c.tokens_estimate))
            .collect()
    }
}

fn preview(content: &str, max_chars: usize) -> String {
    let collapsed: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

/// `sven_model::MessageContent` models one tool call per assistant message,
/// so a chunk with several tool calls renders as several consecutive
/// assistant messages: the first carries the chunk's text (if any), every
/// call after the first gets an empty-text sibling immediately before it.
fn render_assistant(chunk: &Chunk) -> Vec<Message> {
    let Some(tool_calls) = chunk.metadata.tool_calls.as_ref().filter(|tcs| !tcs.is_empty()) else {
        return vec![Message::assistant(chunk.content.clone())];
    };

    let mut out = Vec::with_capacity(tool_calls.len() + 1);
    if !chunk.content.is_empty() {
        out.push(Message::assistant(chunk.content.clone()));
    }
    for tc in tool_calls {
        out.push(Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: tc.id.clone(),
                function: FunctionCall { name: tc.name.clone(), arguments: tc.arguments_text.clone() },
            },
        });
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
