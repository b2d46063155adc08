// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_tools::ToolCall;

/// Per-turn state machine reported to the Presentation Adapter.
///
/// `idle → streaming → dispatching → streaming → … → done | stopped | empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    Dispatching,
    Done,
    Stopped,
    Empty,
}

/// Events emitted by the Turn Engine during a single turn.
/// Consumers (Presentation Adapter implementations) subscribe to these to
/// drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes).
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    ThinkingDelta(String),
    /// A complete thinking/reasoning block.
    ThinkingComplete(String),
    /// The model has requested a tool call.
    ToolCallStarted(ToolCall),
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// The persistent shell's screen snapshot changed.
    ShellSnapshot(String),
    /// Current token usage update.
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        cache_read_total: u64,
        cache_write_total: u64,
        max_tokens: usize,
    },
    /// A branch was created, committed, or closed.
    BranchEvent(String),
    /// The turn's state machine transitioned.
    TurnState(TurnState),
    /// The agent has finished processing the current user turn.
    TurnComplete,
    /// The turn was stopped mid-stream; carries any partial text already
    /// streamed before the cancel signal was observed.
    Aborted { partial_text: String },
    /// A recoverable error occurred.
    Error(String),
}
