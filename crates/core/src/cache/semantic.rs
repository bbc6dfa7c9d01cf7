use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::keys::normalize_exact;
use crate::domain::cache::CacheEntry;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EmbedError {
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// Produces fixed-dimension vectors for semantic cache matching.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Deterministic local embedder: word unigrams plus character trigrams, signed-hashed into a
/// fixed number of buckets and L2-normalized. Good enough to catch rephrasings that share
/// vocabulary; swap in a model-backed [`Embedder`] for anything subtler.
#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a_64(feature.as_bytes());
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let normalized = normalize_exact(text);
        let words: Vec<&str> = normalized
            .split(|ch: char| !(ch.is_alphanumeric() || ch == '\''))
            .filter(|word| !word.is_empty())
            .collect();
        if words.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let mut vector = vec![0.0_f32; self.dimensions];
        for word in &words {
            self.accumulate(&mut vector, &format!("w:{word}"), WORD_WEIGHT);
        }

        let padded: Vec<char> = format!(" {} ", words.join(" ")).chars().collect();
        for window in padded.windows(3) {
            let trigram: String = window.iter().collect();
            self.accumulate(&mut vector, &format!("c:{trigram}"), TRIGRAM_WEIGHT);
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Cosine similarity; zero for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[derive(Clone, Debug, PartialEq)]
pub struct SemanticMatch {
    pub entry: CacheEntry,
    pub similarity: f32,
}

pub struct SemanticMatcher;

impl SemanticMatcher {
    /// Best unexpired candidate at or above `threshold`. Ties on similarity go to the
    /// entry with more hits, then to the newer one.
    pub fn best_match(
        query: &[f32],
        candidates: &[CacheEntry],
        threshold: f32,
        now: DateTime<Utc>,
    ) -> Option<SemanticMatch> {
        candidates
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .filter_map(|entry| {
                let embedding = entry.embedding.as_deref()?;
                let similarity = cosine_similarity(query, embedding);
                (similarity >= threshold).then_some((entry, similarity))
            })
            .max_by(|(left, left_sim), (right, right_sim)| {
                left_sim
                    .partial_cmp(right_sim)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| left.hit_count.cmp(&right.hit_count))
                    .then_with(|| left.created_at.cmp(&right.created_at))
            })
            .map(|(entry, similarity)| SemanticMatch {
                entry: entry.clone(),
                similarity: similarity.min(1.0),
            })
    }
}
