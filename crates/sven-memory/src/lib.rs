// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Recall engine: a two-store long-term memory for the agent kernel.
//!
//! A sqlite-backed **corpus** holds every saved `(user, assistant)` pair
//! together with its embedding. An in-memory **active set** tracks which
//! corpus entries are currently "remembered" — each with a life-points value
//! that decays by one tick per turn and is reinforced on reactivation.

mod active;
mod corpus;
mod embed;

pub use active::ActiveEntry;
pub use corpus::{Corpus, CorpusEntry};
pub use embed::{DeterministicEmbedder, EmbeddingProvider};

use std::path::Path;

use sven_config::MemoryConfig;
use tracing::warn;

use active::ActiveSet;

/// A memory that dropped out of the active set on a `tick()`.
#[derive(Debug, Clone)]
pub struct ForgottenEntry {
    pub hash: String,
    pub user_text: String,
}

/// Ties the corpus, active set, and embedding provider together.
pub struct RecallEngine {
    corpus: Corpus,
    active: ActiveSet,
    embedder: Box<dyn EmbeddingProvider>,
    decay_step: f32,
    active_capacity: usize,
    min_score: f32,
}

impl RecallEngine {
    /// Open (creating if absent) the sqlite corpus at `db_path`, falling back
    /// to an in-memory corpus with a warning if the file cannot be opened —
    /// recall degrades to a no-op store rather than failing startup.
    pub fn open(db_path: &Path, config: &MemoryConfig, embedder: Box<dyn EmbeddingProvider>) -> Self {
        let corpus = match Corpus::open(db_path, config.embedding_dim) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = %db_path.display(), "failed to open recall corpus; using in-memory fallback");
                Corpus::in_memory(config.embedding_dim)
            }
        };
        Self {
            corpus,
            active: ActiveSet::new(config.active_capacity),
            embedder,
            decay_step: config.decay_step,
            active_capacity: config.active_capacity,
            min_score: config.min_score,
        }
    }

    /// Construct a purely in-memory engine (used by tests and when no
    /// `recall_db_path` is configured).
    pub fn in_memory(config: &MemoryConfig, embedder: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            corpus: Corpus::in_memory(config.embedding_dim),
            active: ActiveSet::new(config.active_capacity),
            embedder,
            decay_step: config.decay_step,
            active_capacity: config.active_capacity,
            min_score: config.min_score,
        }
    }

    /// Save a conversation pair to the corpus. Idempotent on duplicate content
    /// hashes. Failures are logged and swallowed — recall is never allowed to
    /// fail a turn.
    pub async fn save(&mut self, user_text: &str, assistant_text: &str) {
        let hash = content_hash(user_text, assistant_text);
        if self.corpus.contains(&hash) {
            return;
        }
        let embedding = match self.embedder.embed(user_text).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "recall embedding failed; skipping save");
                return;
            }
        };
        if let Err(e) = self.corpus.insert(&hash, user_text, assistant_text, &embedding) {
            warn!(error = %e, "recall corpus insert failed");
        }
    }

    /// Decay every active entry's life-points by one step. Entries that reach
    /// zero or below leave the active set. Returns the forgotten entries.
    pub fn tick(&mut self) -> Vec<ForgottenEntry> {
        self.active
            .tick(self.decay_step)
            .into_iter()
            .map(|e| ForgottenEntry { hash: e.hash, user_text: e.user_text })
            .collect()
    }

    /// Score corpus entries against `query` (optionally contextualised by
    /// `context`, a short recent-conversation prefix) and promote up to `k`
    /// accepted entries (score ≥ `min_score`) into the active set.
    /// Reactivating an already-active entry resets its life-points to 1.0.
    /// Returns the number of newly activated (not merely reinforced) entries.
    pub async fn recall(&mut self, query: &str, k: usize, context: Option<&str>) -> usize {
        let probe = match context {
            Some(ctx) => format!("{ctx}\n{query}"),
            None => query.to_string(),
        };
        let embedding = match self.embedder.embed(&probe).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "recall query embedding failed; skipping retrieval");
                return 0;
            }
        };

        let mut scored = self.corpus.score_all(&embedding);
        scored.retain(|(_, score)| *score >= self.min_score);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut newly_activated = 0;
        for (entry, _score) in scored.into_iter().take(k) {
            if self.active.reinforce(&entry.hash) {
                continue;
            }
            self.active.activate(entry.hash.clone(), entry.user_text.clone(), self.active_capacity);
            newly_activated += 1;
        }
        newly_activated
    }

    /// Render the active set as a digest suitable for a transient recall
    /// prelude message. Returns `None` when the active set is empty.
    pub fn render_active(&self) -> Option<String> {
        self.active.render()
    }
}

fn content_hash(user_text: &str, assistant_text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(user_text.as_bytes());
    hasher.update(b"\0");
    hasher.update(assistant_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecallEngine {
        let cfg = MemoryConfig::default();
        RecallEngine::in_memory(&cfg, Box::new(DeterministicEmbedder::new(cfg.embedding_dim)))
    }

    #[tokio::test]
    async fn save_is_idempotent_on_duplicate_content() {
        let mut e = engine();
        e.save("hello", "hi there").await;
        e.save("hello", "hi there").await;
        assert_eq!(e.corpus.len(), 1);
    }

    #[tokio::test]
    async fn recall_activates_a_matching_entry() {
        let mut e = engine();
        e.save("what is the deploy command", "run `make deploy`").await;
        let n = e.recall("deploy command", 4, None).await;
        assert_eq!(n, 1);
        assert!(e.render_active().unwrap().contains("deploy"));
    }

    #[tokio::test]
    async fn recall_below_min_score_is_not_activated() {
        let mut e = engine();
        e.save("unrelated fact about bananas", "bananas are yellow").await;
        let n = e.recall("quantum computing architecture", 4, None).await;
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn reactivating_an_active_entry_resets_life_points_without_double_counting() {
        let mut e = engine();
        e.save("deploy process", "use make deploy").await;
        e.recall("deploy process", 4, None).await;
        e.tick();
        let n = e.recall("deploy process", 4, None).await;
        assert_eq!(n, 0, "reinforcement should not count as a new activation");
    }

    #[tokio::test]
    async fn tick_without_recall_eventually_empties_active_set() {
        let mut e = engine();
        e.save("a", "b").await;
        e.recall("a", 4, None).await;
        assert!(e.render_active().is_some());
        for _ in 0..10 {
            e.tick();
        }
        assert!(e.render_active().is_none());
    }

    #[test]
    fn render_active_empty_is_none() {
        let e = engine();
        assert!(e.render_active().is_none());
    }
}
