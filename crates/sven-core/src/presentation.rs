// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Presentation Adapter: the narrow surface the Turn Engine calls into
//! to report progress, kept deliberately small so a full interactive UI and
//! a headless stdout writer can both implement it without either one
//! constraining the other's design.

use sven_tools::{ToolCall, ToolOutput};

use crate::events::TurnState;

/// Implemented by whatever renders the agent's output: a terminal UI, a
/// CI log writer, a WebSocket bridge. The Turn Engine never assumes which.
pub trait PresentationAdapter: Send + Sync {
    fn on_content_delta(&self, text: &str);
    fn on_tool_call_started(&self, call: &ToolCall);
    fn on_tool_result(&self, result: &ToolOutput);
    fn on_turn_state(&self, state: TurnState);
    fn on_shell_snapshot(&self, text: &str);
}

/// Line-buffered stdout writer: the reference implementation used for
/// headless/CI runs and exercised by the core's own tests.
///
/// Grounded on the donor's CI pipeline mode, which streams clean assistant
/// text to stdout with no decoration; tool activity is logged via
/// `tracing` rather than interleaved into the text stream, so piped output
/// stays parseable.
#[derive(Debug, Default)]
pub struct StdoutAdapter;

impl PresentationAdapter for StdoutAdapter {
    fn on_content_delta(&self, text: &str) {
        use std::io::Write;
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_tool_call_started(&self, call: &ToolCall) {
        tracing::info!(tool = %call.name, id = %call.id, "tool call started");
    }

    fn on_tool_result(&self, result: &ToolOutput) {
        tracing::info!(id = %result.call_id, is_error = result.is_error, "tool result");
    }

    fn on_turn_state(&self, state: TurnState) {
        tracing::debug!(?state, "turn state");
    }

    fn on_shell_snapshot(&self, text: &str) {
        tracing::trace!(bytes = text.len(), "shell snapshot updated");
    }
}

/// Collects events in memory instead of writing anywhere; used by core tests
/// that need to assert on what the Turn Engine reported.
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    pub deltas: std::sync::Mutex<Vec<String>>,
    pub tool_calls: std::sync::Mutex<Vec<String>>,
    pub tool_results: std::sync::Mutex<Vec<(String, bool)>>,
    pub states: std::sync::Mutex<Vec<TurnState>>,
    pub shell_snapshots: std::sync::Mutex<Vec<String>>,
}

impl PresentationAdapter for RecordingAdapter {
    fn on_content_delta(&self, text: &str) {
        self.deltas.lock().unwrap().push(text.to_string());
    }

    fn on_tool_call_started(&self, call: &ToolCall) {
        self.tool_calls.lock().unwrap().push(call.name.clone());
    }

    fn on_tool_result(&self, result: &ToolOutput) {
        self.tool_results.lock().unwrap().push((result.call_id.clone(), result.is_error));
    }

    fn on_turn_state(&self, state: TurnState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_shell_snapshot(&self, text: &str) {
        self.shell_snapshots.lock().unwrap().push(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_adapter_captures_content_deltas() {
        let adapter = RecordingAdapter::default();
        adapter.on_content_delta("hello");
        adapter.on_content_delta(" world");
        assert_eq!(*adapter.deltas.lock().unwrap(), vec!["hello", " world"]);
    }

    #[test]
    fn recording_adapter_captures_turn_states() {
        let adapter = RecordingAdapter::default();
        adapter.on_turn_state(TurnState::Streaming);
        adapter.on_turn_state(TurnState::Done);
        assert_eq!(*adapter.states.lock().unwrap(), vec![TurnState::Streaming, TurnState::Done]);
    }
}
