// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Embedding provider interface.
//!
//! The core only defines the trait and a deterministic fallback used by
//! tests and when no remote provider is configured. A production HTTP-backed
//! embedder (e.g. against an OpenAI-compatible `/v1/embeddings` endpoint)
//! lives outside the core and is injected by the composition root.

use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    /// Dimensionality of vectors this provider produces.
    fn dim(&self) -> usize;
}

/// A stable, dependency-free embedder: hashes overlapping trigrams of the
/// input into `dim` buckets and L2-normalizes. Not semantically meaningful,
/// but deterministic and fast — good enough for tests and as the "no remote
/// provider configured" default, where keyword overlap via the hashing
/// already gives reasonable recall behavior for exact/near-exact phrases.
pub struct DeterministicEmbedder {
    dim: usize,
}

impl DeterministicEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        let normalized = text.to_lowercase();
        let bytes: Vec<u8> = normalized.bytes().collect();
        if bytes.is_empty() {
            return Ok(v);
        }
        let window = 3.min(bytes.len());
        for i in 0..=(bytes.len() - window) {
            let gram = &bytes[i..i + window];
            let h = fnv1a(gram);
            v[(h as usize) % self.dim] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embed_is_deterministic() {
        let e = DeterministicEmbedder::new(64);
        let a = e.embed("hello world").await.unwrap();
        let b = e.embed("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn embed_is_unit_normalized() {
        let e = DeterministicEmbedder::new(64);
        let v = e.embed("some text to embed").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let e = DeterministicEmbedder::new(32);
        let v = e.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn similar_text_has_higher_cosine_than_unrelated_text() {
        let e = DeterministicEmbedder::new(256);
        let a = e.embed("deploy the service to production").await.unwrap();
        let b = e.embed("deploy the service to staging").await.unwrap();
        let c = e.embed("bananas are a good source of potassium").await.unwrap();
        let cos = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(p, q)| p * q).sum() };
        assert!(cos(&a, &b) > cos(&a, &c));
    }
}
