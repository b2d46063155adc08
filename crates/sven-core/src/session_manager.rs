// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable session storage: one JSON file per session plus an `index.json`
//! summary map, so the operator can list and resume past conversations
//! without deserializing every chunk store up front.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chunk::{ChunkKind, ChunkStore};

const SHELL_CLOSED_MARKER: &str = "\n\n[Terminal closed. Reopen available]";

/// On-disk representation of one session, matching the session file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub workspace_dir: String,
    pub model: String,
    pub chunks: Value,
    pub token_count: usize,
    pub message_count: usize,
    pub shell_open: bool,
    pub shell_pid: Option<u32>,
}

/// Lightweight entry kept in `index.json`, cheap to list without touching
/// the full per-session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub workspace: String,
    pub model: String,
    pub message_count: usize,
    pub token_count: usize,
    pub shell_was_open: bool,
}

/// A session reconstructed from disk, ready to resume.
pub struct RestoredSession {
    pub store: ChunkStore,
    pub session_id: String,
    pub workspace_dir: String,
    pub model: String,
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn derive_title(store: &ChunkStore) -> String {
    let first_user = store.chunks().iter().find(|c| c.kind == ChunkKind::User).map(|c| c.content.as_str());
    match first_user {
        Some(text) => {
            let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.chars().count() <= 30 {
                collapsed
            } else {
                format!("{}…", collapsed.chars().take(30).collect::<String>())
            }
        }
        None => "(empty session)".to_string(),
    }
}

pub struct SessionManager {
    dir: PathBuf,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    /// Save `store` as a session, reusing `id` if given, otherwise minting a
    /// fresh one. Rewrites `index.json` afterward.
    pub fn save(
        &self,
        store: &ChunkStore,
        workspace: &str,
        model: &str,
        shell_open: bool,
        shell_pid: Option<u32>,
        id: Option<String>,
    ) -> anyhow::Result<SessionSnapshot> {
        fs::create_dir_all(&self.dir)?;
        let session_id = id.unwrap_or_else(new_session_id);
        let snapshot = SessionSnapshot {
            session_id: session_id.clone(),
            title: derive_title(store),
            timestamp: Utc::now(),
            workspace_dir: workspace.to_string(),
            model: model.to_string(),
            chunks: store.serialize(),
            token_count: store.token_total(),
            message_count: store.len(),
            shell_open,
            shell_pid,
        };
        let body = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.session_path(&session_id), body)?;
        self.rebuild_index()?;
        Ok(snapshot)
    }

    /// Load and reconstruct a session. Returns `None` if the file is missing
    /// or unreadable; unreadable files are logged, not treated as fatal.
    pub fn load(&self, id: &str) -> Option<RestoredSession> {
        let raw = match fs::read_to_string(self.session_path(id)) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "session file unreadable");
                return None;
            }
        };
        let snapshot: SessionSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "session file corrupt");
                return None;
            }
        };
        let mut store = match ChunkStore::deserialize(snapshot.chunks) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "session chunks corrupt");
                return None;
            }
        };
        if snapshot.shell_open {
            restore_shell_marker(&mut store);
        }
        Some(RestoredSession {
            store,
            session_id: snapshot.session_id,
            workspace_dir: snapshot.workspace_dir,
            model: snapshot.model,
        })
    }

    /// List sessions newest-first. Rebuilds `index.json` from the directory
    /// contents first if it is missing or unparsable.
    pub fn list(&self, limit: usize) -> Vec<SessionSummary> {
        let mut summaries = self.read_index().unwrap_or_default();
        if summaries.is_empty() && self.dir.is_dir() {
            if let Ok(rebuilt) = self.rebuild_index() {
                summaries = rebuilt;
            }
        }
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        summaries.truncate(limit);
        summaries
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        let path = self.session_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.rebuild_index()?;
        Ok(())
    }

    fn read_index(&self) -> Option<Vec<SessionSummary>> {
        let raw = fs::read_to_string(self.index_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Rebuild `index.json` by reading every `<id>.json` in the directory.
    /// Tolerant of corrupt individual session files (they're skipped).
    fn rebuild_index(&self) -> anyhow::Result<Vec<SessionSummary>> {
        fs::create_dir_all(&self.dir)?;
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("index.json") {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else { continue };
            let Ok(snap) = serde_json::from_str::<SessionSnapshot>(&raw) else { continue };
            summaries.push(SessionSummary {
                id: snap.session_id,
                title: snap.title,
                timestamp: snap.timestamp,
                workspace: snap.workspace_dir,
                model: snap.model,
                message_count: snap.message_count,
                token_count: snap.token_count,
                shell_was_open: snap.shell_open,
            });
        }
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let body = serde_json::to_string_pretty(&summaries)?;
        fs::write(self.index_path(), body)?;
        Ok(summaries)
    }
}

/// Idempotently append the closed-terminal marker to the shell chunk, if one
/// exists and doesn't already carry the marker.
fn restore_shell_marker(store: &mut ChunkStore) {
    let Some(shell) = store.chunks().iter().find(|c| c.kind == ChunkKind::Shell) else { return };
    if shell.content.ends_with(SHELL_CLOSED_MARKER.trim_start()) {
        return;
    }
    let id = shell.id.clone();
    let new_content = format!("{}{}", shell.content, SHELL_CLOSED_MARKER);
    let _ = store.edit(&id, new_content);
}

pub fn sessions_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("sessions")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().join("sessions"));
        (dir, mgr)
    }

    #[test]
    fn save_then_load_round_trips_chunks() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.append(ChunkKind::System, "sys");
        store.append(ChunkKind::User, "hello there");
        let snap = mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();

        let restored = mgr.load(&snap.session_id).unwrap();
        assert_eq!(restored.store.len(), store.len());
        assert_eq!(restored.workspace_dir, "/ws");
        assert_eq!(restored.model, "gpt");
    }

    #[test]
    fn title_derives_from_first_user_chunk() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.append(ChunkKind::User, "x".repeat(50));
        let snap = mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();
        assert!(snap.title.ends_with('…'));
        assert_eq!(snap.title.chars().count(), 31);
    }

    #[test]
    fn load_missing_session_returns_none() {
        let (_tmp, mgr) = tmp_manager();
        assert!(mgr.load("nonexistent").is_none());
    }

    #[test]
    fn list_sorts_newest_first() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.append(ChunkKind::User, "a");
        let s1 = mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let s2 = mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();
        let list = mgr.list(10);
        assert_eq!(list[0].id, s2.session_id);
        assert_eq!(list[1].id, s1.session_id);
    }

    #[test]
    fn delete_removes_from_list() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.append(ChunkKind::User, "a");
        let snap = mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();
        mgr.delete(&snap.session_id).unwrap();
        assert!(mgr.list(10).is_empty());
    }

    #[test]
    fn restore_appends_shell_closed_marker_once() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.upsert_shell("$ echo hi\nhi", false);
        let snap = mgr.save(&store, "/ws", "gpt", true, Some(123), None).unwrap();

        let restored = mgr.load(&snap.session_id).unwrap();
        let shell = restored.store.chunks().iter().find(|c| c.kind == ChunkKind::Shell).unwrap();
        assert!(shell.content.contains("Terminal closed"));

        // Save and reload again: marker must not double up.
        let snap2 = mgr.save(&restored.store, "/ws", "gpt", true, Some(123), Some(snap.session_id)).unwrap();
        let restored2 = mgr.load(&snap2.session_id).unwrap();
        let shell2 = restored2.store.chunks().iter().find(|c| c.kind == ChunkKind::Shell).unwrap();
        assert_eq!(shell2.content.matches("Terminal closed").count(), 1);
    }

    #[test]
    fn index_rebuilds_when_missing() {
        let (_tmp, mgr) = tmp_manager();
        let mut store = ChunkStore::new();
        store.append(ChunkKind::User, "a");
        mgr.save(&store, "/ws", "gpt", false, None, None).unwrap();
        fs::remove_file(mgr.index_path()).unwrap();
        assert_eq!(mgr.list(10).len(), 1);
    }
}
