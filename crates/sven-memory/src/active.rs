// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The active set: corpus entries currently "remembered" by the agent.

/// One entry in the active set.
#[derive(Debug, Clone)]
pub struct ActiveEntry {
    pub hash: String,
    pub user_text: String,
    pub life_points: f32,
}

pub(crate) struct ActiveSet {
    entries: Vec<ActiveEntry>,
    capacity: usize,
}

impl ActiveSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity }
    }

    /// Decrement every entry's life-points by `step`; drop and return any
    /// entry that reaches ≤0.
    pub(crate) fn tick(&mut self, step: f32) -> Vec<ActiveEntry> {
        for e in &mut self.entries {
            e.life_points -= step;
        }
        let (keep, forgotten): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.life_points > 0.0);
        self.entries = keep;
        forgotten
    }

    /// If `hash` is already active, reset its life-points to 1.0 and return
    /// `true`. Otherwise return `false` without mutating anything.
    pub(crate) fn reinforce(&mut self, hash: &str) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| e.hash == hash) {
            e.life_points = 1.0;
            true
        } else {
            false
        }
    }

    /// Activate a new entry at life-points 1.0, evicting the lowest
    /// life-points entry first if the set is at `capacity`.
    pub(crate) fn activate(&mut self, hash: String, user_text: String, capacity: usize) {
        self.capacity = capacity;
        if self.entries.len() >= self.capacity.max(1) {
            if let Some((idx, _)) = self
                .entries
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.life_points.partial_cmp(&b.1.life_points).unwrap())
            {
                self.entries.remove(idx);
            }
        }
        self.entries.push(ActiveEntry { hash, user_text, life_points: 1.0 });
    }

    pub(crate) fn render(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut lines = vec!["[recalled from earlier conversation]".to_string()];
        for e in &self.entries {
            lines.push(format!("- {}", e.user_text));
        }
        Some(lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_adds_entry_at_full_life() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "text".into(), 4);
        assert_eq!(s.entries.len(), 1);
        assert_eq!(s.entries[0].life_points, 1.0);
    }

    #[test]
    fn tick_decreases_life_points() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "t".into(), 4);
        s.tick(0.2);
        assert!((s.entries[0].life_points - 0.8).abs() < 1e-6);
    }

    #[test]
    fn tick_removes_entries_at_or_below_zero() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "t".into(), 4);
        for _ in 0..5 {
            s.tick(0.2);
        }
        assert!(s.entries.is_empty());
    }

    #[test]
    fn tick_returns_forgotten_entries() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "forget me".into(), 4);
        for _ in 0..4 {
            s.tick(0.2);
        }
        let forgotten = s.tick(0.2);
        assert_eq!(forgotten.len(), 1);
        assert_eq!(forgotten[0].user_text, "forget me");
    }

    #[test]
    fn reinforce_resets_life_points_to_one() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "t".into(), 4);
        s.tick(0.5);
        assert!(s.reinforce("h1"));
        assert_eq!(s.entries[0].life_points, 1.0);
    }

    #[test]
    fn reinforce_unknown_hash_returns_false() {
        let mut s = ActiveSet::new(4);
        assert!(!s.reinforce("nope"));
    }

    #[test]
    fn activate_at_capacity_evicts_lowest_life_points() {
        let mut s = ActiveSet::new(2);
        s.activate("h1".into(), "old".into(), 2);
        s.tick(0.5); // h1 now at 0.5
        s.activate("h2".into(), "new".into(), 2);
        s.activate("h3".into(), "newest".into(), 2);
        // h1 (lowest) should have been evicted, h2 and h3 remain
        assert_eq!(s.entries.len(), 2);
        assert!(s.entries.iter().all(|e| e.hash != "h1"));
    }

    #[test]
    fn render_empty_set_is_none() {
        let s = ActiveSet::new(4);
        assert!(s.render().is_none());
    }

    #[test]
    fn render_includes_all_active_entries() {
        let mut s = ActiveSet::new(4);
        s.activate("h1".into(), "fact one".into(), 4);
        s.activate("h2".into(), "fact two".into(), 4);
        let rendered = s.render().unwrap();
        assert!(rendered.contains("fact one"));
        assert!(rendered.contains("fact two"));
    }
}
