// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The corpus: every conversation pair ever saved, persisted in sqlite with
//! an FTS5 mirror table for a lexical fallback.

use std::path::Path;

use rusqlite::Connection;

/// One corpus record.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub hash: String,
    pub user_text: String,
    pub assistant_text: String,
    pub embedding: Vec<f32>,
}

pub struct Corpus {
    conn: Connection,
    /// Expected embedding dimensionality. A corpus opened with a stored
    /// dimensionality mismatch is discarded (schema reset) rather than
    /// silently corrupting vectors.
    dim: usize,
}

impl Corpus {
    pub fn open(path: &Path, dim: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, dim)
    }

    pub fn in_memory(dim: usize) -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite connection");
        Self::init(conn, dim).expect("in-memory schema init")
    }

    fn init(conn: Connection, dim: usize) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS entries (
                 hash TEXT PRIMARY KEY,
                 user_text TEXT NOT NULL,
                 assistant_text TEXT NOT NULL,
                 embedding BLOB NOT NULL
             );
             CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
                 hash UNINDEXED, user_text, assistant_text, content=''
             );",
        )?;

        let stored_dim: Option<String> =
            conn.query_row("SELECT value FROM meta WHERE key = 'embedding_dim'", [], |r| r.get(0)).ok();

        match stored_dim {
            Some(s) if s.parse::<usize>().ok() != Some(dim) => {
                tracing::warn!(
                    stored = %s,
                    expected = dim,
                    "recall corpus embedding dimensionality mismatch; resetting corpus"
                );
                conn.execute_batch("DELETE FROM entries; DELETE FROM entries_fts;")?;
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_dim', ?1)",
                    [dim.to_string()],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_dim', ?1)",
                    [dim.to_string()],
                )?;
            }
            _ => {}
        }

        Ok(Self { conn, dim })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.conn
            .query_row("SELECT 1 FROM entries WHERE hash = ?1", [hash], |_| Ok(()))
            .is_ok()
    }

    pub fn insert(
        &mut self,
        hash: &str,
        user_text: &str,
        assistant_text: &str,
        embedding: &[f32],
    ) -> anyhow::Result<()> {
        let blob = encode_embedding(embedding);
        self.conn.execute(
            "INSERT OR IGNORE INTO entries (hash, user_text, assistant_text, embedding) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![hash, user_text, assistant_text, blob],
        )?;
        self.conn.execute(
            "INSERT INTO entries_fts (hash, user_text, assistant_text) VALUES (?1, ?2, ?3)",
            rusqlite::params![hash, user_text, assistant_text],
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Score every corpus entry against `query_embedding` via cosine
    /// similarity. Returns `(entry, score)` pairs in no particular order —
    /// callers sort/filter as needed.
    pub fn score_all(&self, query_embedding: &[f32]) -> Vec<(CorpusEntry, f32)> {
        let mut stmt = match self
            .conn
            .prepare("SELECT hash, user_text, assistant_text, embedding FROM entries")
        {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        let rows = stmt.query_map([], |row| {
            let hash: String = row.get(0)?;
            let user_text: String = row.get(1)?;
            let assistant_text: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            Ok((hash, user_text, assistant_text, blob))
        });
        let Ok(rows) = rows else { return vec![] };

        let mut out = Vec::new();
        for row in rows.flatten() {
            let (hash, user_text, assistant_text, blob) = row;
            let embedding = decode_embedding(&blob, self.dim);
            let score = cosine_similarity(query_embedding, &embedding);
            out.push((CorpusEntry { hash, user_text, assistant_text, embedding }, score));
        }
        out
    }
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8], dim: usize) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    for chunk in blob.chunks_exact(4) {
        v.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    v
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
