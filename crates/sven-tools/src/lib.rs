// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod events;
pub mod policy;
pub mod registry;
pub mod tool;

pub use events::{TodoItem, ToolEvent};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, RetentionPolicy, Tool, ToolCall, ToolOutput, ToolOutputPart};

pub mod sandbox;
pub mod shell_worker;

// New tool exports
pub use builtin::apply_patch::ApplyPatchTool;
pub use builtin::ask_question::{AskQuestionTool, Question, QuestionRequest};
pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::find_file::FindFileTool;
pub use builtin::fs::FsTool;
pub use builtin::glob::GlobTool;
pub use builtin::glob_file_search::GlobFileSearchTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::read_image::ReadImageTool;
pub use builtin::read_lints::ReadLintsTool;
pub use builtin::run_terminal_command::RunTerminalCommandTool;
pub use builtin::search_codebase::SearchCodebaseTool;
pub use builtin::switch_mode::SwitchModeTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::update_memory::UpdateMemoryTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::web_search::WebSearchTool;
pub use builtin::write_file::WriteTool;

// Branch-mode tools: schema-only, intercepted and executed by sven-core's
// Agent directly (see DESIGN.md, "Branch Engine tool wiring").
pub use builtin::commit_changes::CommitChangesTool;
pub use builtin::compress_chunks::CompressChunksTool;
pub use builtin::exit_branch::ExitBranchTool;
pub use builtin::preview_changes::PreviewChangesTool;
pub use builtin::remove_chunks::RemoveChunksTool;
pub use builtin::rewrite_chunk::RewriteChunkTool;
pub use builtin::rollback_changes::RollbackChangesTool;
pub use builtin::stay_silent::StaySilentTool;
pub use builtin::view_chunk_detail::ViewChunkDetailTool;

// GDB debugging tools
pub use builtin::gdb::state::GdbSessionState;
pub use builtin::gdb::{
    GdbCommandTool, GdbConnectTool, GdbInterruptTool, GdbStartServerTool, GdbStatusTool,
    GdbStopTool, GdbWaitStoppedTool,
};

// Skill loading tool
pub use builtin::load_skill::LoadSkillTool;

// NOTE: `list_knowledge.rs` / `search_knowledge.rs` exist under `builtin/`
// but are not declared as `pub mod` in `builtin/mod.rs` and nothing in the
// registry calls them. Candidates for the final trimming pass.
//
// `write_file.rs` didn't exist on disk despite `builtin/mod.rs` declaring
// `pub mod write_file;` and this file re-exporting `WriteTool` from it — the
// file previously lived at `builtin/write.rs` under the tool name `"write"`.
// Renamed to `write_file.rs` with `name()` returning `"write_file"` to match
// what callers already expected.

pub use builtin::shell::{ShellInterruptTool, ShellOpenTool, ShellRunCommandTool};
pub use shell_worker::ShellWorker;
