// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Branch Engine: a temporary clone of the agent whose only job is to
//! edit its parent's [`crate::chunk::ChunkStore`].
//!
//! A branch never talks to the LLM on the parent's behalf; it runs its own
//! short Turn-Engine-style loop (driven by [`crate::agent::Agent`]) against a
//! restricted toolset. Edits are staged and only take effect on
//! [`Branch::commit`].

use chrono::{DateTime, Utc};

use crate::chunk::ChunkStore;

/// Why a branch was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTrigger {
    Auto,
    Manual,
}

impl std::fmt::Display for BranchTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A single staged edit against the parent store, addressed by the index it
/// had in the parent store at staging time.
#[derive(Debug, Clone)]
pub enum BranchOp {
    Rewrite { index: usize, new_content: String },
    /// Inclusive range `[start, end]`; `start` becomes the summary chunk,
    /// the rest of the range is removed.
    Compress { start: usize, end: usize, summary: String },
    Remove { index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BranchError {
    AlreadyActive,
    NoActiveBranch,
    AlreadyCommitted,
    PendingOpsExist,
    NoPendingOps,
    InvalidIndex(usize),
    ChunkOp(crate::chunk::ChunkOpError),
}

impl std::fmt::Display for BranchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a branch is already active"),
            Self::NoActiveBranch => write!(f, "no branch is active"),
            Self::AlreadyCommitted => write!(f, "branch changes were already committed"),
            Self::PendingOpsExist => write!(f, "cannot exit branch with uncommitted changes pending"),
            Self::NoPendingOps => write!(f, "no pending changes to commit"),
            Self::InvalidIndex(i) => write!(f, "chunk index {i} out of range"),
            Self::ChunkOp(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BranchError {}

impl From<crate::chunk::ChunkOpError> for BranchError {
    fn from(e: crate::chunk::ChunkOpError) -> Self {
        Self::ChunkOp(e)
    }
}

/// Record of a closed branch, kept for operator visibility.
#[derive(Debug, Clone)]
pub struct BranchClosure {
    pub timestamp: DateTime<Utc>,
    pub trigger: BranchTrigger,
    pub ops_count: usize,
    pub committed: bool,
}

/// A live branch: its own chunk store plus the pending edits queued against
/// the parent.
pub struct Branch {
    pub trigger: BranchTrigger,
    pub store: ChunkStore,
    /// Deep copy of the parent store at creation time, kept so the caller can
    /// discard the whole branch attempt and restore the parent verbatim.
    parent_snapshot: ChunkStore,
    pub token_budget: usize,
    pending: Vec<BranchOp>,
    committed: bool,
    ops_applied: usize,
}

impl Branch {
    pub fn parent_snapshot(&self) -> &ChunkStore {
        &self.parent_snapshot
    }

    pub fn pending_ops(&self) -> &[BranchOp] {
        &self.pending
    }

    pub fn stage(&mut self, op: BranchOp) -> Result<(), BranchError> {
        if self.committed {
            return Err(BranchError::AlreadyCommitted);
        }
        self.pending.push(op);
        Ok(())
    }

    /// Enumerate pending ops and estimate the net token delta they would
    /// apply to the parent store, without mutating anything.
    pub fn preview(&self, parent: &ChunkStore) -> Result<(Vec<String>, i64), BranchError> {
        let mut lines = Vec::with_capacity(self.pending.len());
        let mut delta: i64 = 0;
        for op in &self.pending {
            match op {
                BranchOp::Rewrite { index, new_content } => {
                    let chunk = parent.chunks().get(*index).ok_or(BranchError::InvalidIndex(*index))?;
                    let new_tokens = (new_content.len() / 4).max(1) as i64;
                    delta += new_tokens - chunk.tokens_estimate as i64;
                    lines.push(format!("rewrite #{index}: {} -> {} tokens", chunk.tokens_estimate, new_tokens));
                }
                BranchOp::Compress { start, end, summary } => {
                    let range = parent
                        .chunks()
                        .get(*start..=*end)
                        .ok_or(BranchError::InvalidIndex(*end))?;
                    let old_tokens: i64 = range.iter().map(|c| c.tokens_estimate as i64).sum();
                    let new_tokens = (summary.len() / 4).max(1) as i64;
                    delta += new_tokens - old_tokens;
                    lines.push(format!("compress #{start}..=#{end}: {old_tokens} -> {new_tokens} tokens"));
                }
                BranchOp::Remove { index } => {
                    let chunk = parent.chunks().get(*index).ok_or(BranchError::InvalidIndex(*index))?;
                    delta -= chunk.tokens_estimate as i64;
                    lines.push(format!("remove #{index}: -{} tokens", chunk.tokens_estimate));
                }
            }
        }
        Ok((lines, delta))
    }

    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Apply staged ops to `parent` in commit order: rewrites, then
    /// compresses, then removals back-to-front. Resolves every op's target
    /// chunk id up front (against indices as staged) so later ops never see
    /// shifted indices from earlier ones in the same commit.
    pub fn commit(&mut self, parent: &mut ChunkStore) -> Result<usize, BranchError> {
        if self.committed {
            return Err(BranchError::AlreadyCommitted);
        }
        if self.pending.is_empty() {
            return Err(BranchError::NoPendingOps);
        }

        let mut rewrites = Vec::new();
        let mut compresses = Vec::new();
        let mut removes = Vec::new();
        for op in &self.pending {
            match op {
                BranchOp::Rewrite { index, new_content } => {
                    let id = parent.chunks().get(*index).ok_or(BranchError::InvalidIndex(*index))?.id.clone();
                    rewrites.push((id, new_content.clone()));
                }
                BranchOp::Compress { start, end, summary } => {
                    let range = parent.chunks().get(*start..=*end).ok_or(BranchError::InvalidIndex(*end))?;
                    let ids: Vec<String> = range.iter().map(|c| c.id.clone()).collect();
                    compresses.push((ids, summary.clone()));
                }
                BranchOp::Remove { index } => {
                    let id = parent.chunks().get(*index).ok_or(BranchError::InvalidIndex(*index))?.id.clone();
                    removes.push((*index, id));
                }
            }
        }

        for (id, content) in &rewrites {
            parent.edit(id, content.clone())?;
        }
        for (ids, summary) in &compresses {
            let Some((head, tail)) = ids.split_first() else { continue };
            parent.edit(head, summary.clone())?;
            for id in tail.iter().rev() {
                parent.delete(id)?;
            }
        }
        removes.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in &removes {
            parent.delete(id)?;
        }

        let applied = self.pending.len();
        self.pending.clear();
        self.committed = true;
        self.ops_applied = applied;
        Ok(applied)
    }
}

/// Owns at most one live [`Branch`] plus a bounded history of closed ones.
pub struct BranchEngine {
    active: Option<Branch>,
    history: Vec<BranchClosure>,
    history_cap: usize,
}

impl Default for BranchEngine {
    fn default() -> Self {
        Self { active: None, history: Vec::new(), history_cap: 20 }
    }
}

impl BranchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&Branch> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut Branch> {
        self.active.as_mut()
    }

    pub fn history(&self) -> &[BranchClosure] {
        &self.history
    }

    /// Spawn a branch. `seed` is the fully assembled system prompt for the
    /// branch's own chunk store (parent prompt + branch directive + chunk
    /// overview + skills blurb — assembled by the caller, since only the
    /// Turn Engine knows the parent's live system prompt and skill set).
    pub fn create(
        &mut self,
        parent: &ChunkStore,
        trigger: BranchTrigger,
        seed: impl Into<String>,
        token_budget: usize,
    ) -> Result<(), BranchError> {
        if self.active.is_some() {
            return Err(BranchError::AlreadyActive);
        }
        let mut store = ChunkStore::new();
        store.append(crate::chunk::ChunkKind::System, seed.into());
        self.active = Some(Branch {
            trigger,
            store,
            parent_snapshot: parent.clone(),
            token_budget,
            pending: Vec::new(),
            committed: false,
            ops_applied: 0,
        });
        Ok(())
    }

    /// Close the active branch. Fails while pending ops exist (spec requires
    /// committing or rolling back first).
    pub fn exit(&mut self) -> Result<(), BranchError> {
        let branch = self.active.as_ref().ok_or(BranchError::NoActiveBranch)?;
        if !branch.pending_ops().is_empty() {
            return Err(BranchError::PendingOpsExist);
        }
        let branch = self.active.take().expect("checked above");
        self.history.push(BranchClosure {
            timestamp: Utc::now(),
            trigger: branch.trigger,
            ops_count: branch.ops_applied,
            committed: branch.committed,
        });
        if self.history.len() > self.history_cap {
            let excess = self.history.len() - self.history_cap;
            self.history.drain(0..excess);
        }
        Ok(())
    }

    /// A one-line overview of each parent chunk, for seeding a branch's
    /// system prompt: `#index kind (N tok): preview`.
    pub fn chunk_overview(parent: &ChunkStore) -> String {
        parent
            .list_chunks()
            .iter()
            .enumerate()
            .map(|(i, (_, kind, preview, tokens))| format!("#{i} {kind:?} ({tokens} tok): {preview}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    fn parent_with_chunks(n: usize) -> ChunkStore {
        let mut s = ChunkStore::new();
        s.append(ChunkKind::System, "base prompt");
        for i in 0..n {
            s.append(ChunkKind::User, format!("message {i}"));
        }
        s
    }

    #[test]
    fn create_fails_when_already_active() {
        let parent = parent_with_chunks(2);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Auto, "seed", 1000).unwrap();
        assert_eq!(
            engine.create(&parent, BranchTrigger::Manual, "seed2", 1000),
            Err(BranchError::AlreadyActive)
        );
    }

    #[test]
    fn exit_refuses_while_pending_ops() {
        let parent = parent_with_chunks(2);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Auto, "seed", 1000).unwrap();
        engine.active_mut().unwrap().stage(BranchOp::Remove { index: 1 }).unwrap();
        assert_eq!(engine.exit(), Err(BranchError::PendingOpsExist));
    }

    #[test]
    fn commit_applies_rewrites_then_compresses_then_removals() {
        let mut parent = parent_with_chunks(4);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Manual, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        branch.stage(BranchOp::Rewrite { index: 1, new_content: "rewritten".into() }).unwrap();
        branch.stage(BranchOp::Remove { index: 4 }).unwrap();
        let applied = branch.commit(&mut parent).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(parent.chunks()[1].content, "rewritten");
        assert_eq!(parent.len(), 4);
    }

    #[test]
    fn double_commit_rejected() {
        let mut parent = parent_with_chunks(2);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Manual, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        branch.stage(BranchOp::Remove { index: 1 }).unwrap();
        branch.commit(&mut parent).unwrap();
        assert_eq!(branch.commit(&mut parent), Err(BranchError::AlreadyCommitted));
    }

    #[test]
    fn rollback_clears_pending_without_touching_parent() {
        let mut parent = parent_with_chunks(2);
        let before = parent.clone().serialize();
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Manual, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        branch.stage(BranchOp::Remove { index: 1 }).unwrap();
        branch.rollback();
        assert!(branch.pending_ops().is_empty());
        assert_eq!(parent.serialize(), before);
    }

    #[test]
    fn compress_keeps_first_index_as_summary() {
        let mut parent = parent_with_chunks(4);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Manual, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        branch.stage(BranchOp::Compress { start: 1, end: 3, summary: "summary of 1-3".into() }).unwrap();
        branch.commit(&mut parent).unwrap();
        assert_eq!(parent.len(), 2); // system + summary
        assert_eq!(parent.chunks()[1].content, "summary of 1-3");
    }

    #[test]
    fn exit_after_commit_succeeds_and_records_history() {
        let mut parent = parent_with_chunks(2);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Auto, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        branch.stage(BranchOp::Remove { index: 1 }).unwrap();
        branch.commit(&mut parent).unwrap();
        engine.exit().unwrap();
        assert!(!engine.is_active());
        assert_eq!(engine.history().len(), 1);
        assert!(engine.history()[0].committed);
    }

    #[test]
    fn commit_with_empty_pending_list_fails() {
        let mut parent = parent_with_chunks(2);
        let mut engine = BranchEngine::new();
        engine.create(&parent, BranchTrigger::Manual, "seed", 1000).unwrap();
        let branch = engine.active_mut().unwrap();
        assert_eq!(branch.commit(&mut parent), Err(BranchError::NoPendingOps));
        assert!(!branch.committed);
    }
}
