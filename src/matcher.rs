//! Candidate ranking for detected objects.
//!
//! Two signals feed the ranking: exact duplicates (the analyzed media shares a
//! content hash with media already linked to an item) and embedding
//! similarity against a bounded pool of item embeddings. Scores merge by item
//! keeping the maximum, then sort descending and truncate to `top_k`.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::MatcherSettings;

/// Score given to caller-supplied hint items.
pub const HINT_SCORE: f32 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ItemScore {
    pub item_id: i64,
    pub score: f32,
}

/// Cosine similarity of two unit vectors, clamped to `[0, 1]`.
///
/// Mismatched dimensions score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    if dot.is_nan() {
        return 0.0;
    }
    dot.clamp(0.0, 1.0)
}

#[derive(Clone, Copy, Debug)]
pub struct CandidateMatcher {
    top_k: usize,
    hash_match_score: f32,
}

impl CandidateMatcher {
    pub fn new(settings: &MatcherSettings) -> Self {
        Self {
            top_k: settings.top_k.max(1),
            hash_match_score: settings.hash_match_score,
        }
    }

    /// Rank items for one object.
    ///
    /// `hash_matches` are items linked to media with the same content hash;
    /// `pool` pairs item ids with stored unit embeddings. Hints are prepended
    /// with [`HINT_SCORE`] and do not count against `top_k`.
    pub fn rank(
        &self,
        hash_matches: &[i64],
        query: Option<&[f32]>,
        pool: &[(i64, Vec<f32>)],
        hints: &[i64],
    ) -> Vec<ItemScore> {
        let mut merged: HashMap<i64, f32> = HashMap::new();
        for &item_id in hash_matches {
            merge_max(&mut merged, item_id, self.hash_match_score);
        }

        if let Some(query) = query {
            let mut similar: Vec<ItemScore> = pool
                .iter()
                .map(|(item_id, embedding)| ItemScore {
                    item_id: *item_id,
                    score: cosine(query, embedding),
                })
                .collect();
            sort_desc(&mut similar);
            // One item may carry several embeddings; keep its best.
            let mut seen = Vec::with_capacity(self.top_k);
            for candidate in similar {
                if seen.contains(&candidate.item_id) {
                    continue;
                }
                seen.push(candidate.item_id);
                merge_max(&mut merged, candidate.item_id, candidate.score);
                if seen.len() == self.top_k {
                    break;
                }
            }
        }

        let mut ranked: Vec<ItemScore> = merged
            .into_iter()
            .filter(|(item_id, _)| !hints.contains(item_id))
            .map(|(item_id, score)| ItemScore { item_id, score })
            .collect();
        sort_desc(&mut ranked);
        ranked.truncate(self.top_k);

        let mut out = Vec::with_capacity(hints.len() + ranked.len());
        for &item_id in hints {
            if out.iter().any(|c: &ItemScore| c.item_id == item_id) {
                continue;
            }
            out.push(ItemScore {
                item_id,
                score: HINT_SCORE,
            });
        }
        out.extend(ranked);
        out
    }
}

fn merge_max(merged: &mut HashMap<i64, f32>, item_id: i64, score: f32) {
    let entry = merged.entry(item_id).or_insert(score);
    if score > *entry {
        *entry = score;
    }
}

/// Descending by score; ties broken by ascending item id.
fn sort_desc(scores: &mut [ItemScore]) {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.item_id.cmp(&b.item_id))
    });
}
