//! Query → procedure matching and list merging.

use std::collections::{BTreeSet, HashMap};

use lobster_core::text::normalize;

use super::{Procedure, tokenize};

/// Matches scoring below this are discarded.
pub const MATCH_CUTOFF: f64 = 0.45;

/// Score a query against one trigger.
///
/// - trigger contained in query → 1.0
/// - query contained in trigger → 0.9
/// - otherwise `max(token Jaccard, 0.8 × sequence ratio)`
pub fn score(query: &str, trigger: &str) -> f64 {
    let q = normalize(query);
    let t = normalize(trigger);
    if q.is_empty() || t.is_empty() {
        return 0.0;
    }
    if q.contains(&t) {
        return 1.0;
    }
    if t.contains(&q) {
        return 0.9;
    }

    let q_tokens: BTreeSet<String> = tokenize(&q).into_iter().collect();
    let t_tokens: BTreeSet<String> = tokenize(&t).into_iter().collect();
    let union = q_tokens.union(&t_tokens).count();
    #[allow(clippy::cast_precision_loss)]
    let jaccard = if union == 0 {
        0.0
    } else {
        q_tokens.intersection(&t_tokens).count() as f64 / union as f64
    };
    jaccard.max(0.8 * sequence_ratio(&q, &t))
}

/// Procedures relevant to `query`, best first, at most `max(1, limit)`.
///
/// Equal scores keep their input order.
pub fn match_query(procedures: &[Procedure], query: &str, limit: usize) -> Vec<Procedure> {
    if query.trim().is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(f64, &Procedure)> = procedures
        .iter()
        .map(|p| (score(query, &p.trigger), p))
        .filter(|(s, _)| *s >= MATCH_CUTOFF)
        .collect();
    // Stable sort keeps discovery order for ties.
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .take(limit.max(1))
        .map(|(_, p)| p.clone())
        .collect()
}

/// Union of two procedure lists; `local` wins on key collision.
///
/// The result is ordered by title, case-insensitively.
pub fn merge_procedures(global: &[Procedure], local: &[Procedure]) -> Vec<Procedure> {
    let mut by_key: HashMap<String, Procedure> = HashMap::new();
    for p in global.iter().chain(local) {
        let _ = by_key.insert(p.key(), p.clone());
    }
    let mut merged: Vec<Procedure> = by_key.into_values().collect();
    merged.sort_by_cached_key(|p| (p.title.to_lowercase(), p.key()));
    merged
}

/// Ratcliff–Obershelp similarity: `2·M / (|a| + |b|)` over chars, where `M`
/// is the total size of the recursively found longest matching blocks.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b, 0, a.len(), 0, b.len());
    #[allow(clippy::cast_precision_loss)]
    let ratio = 2.0 * matched as f64 / total as f64;
    ratio
}

fn matching_chars(a: &[char], b: &[char], alo: usize, ahi: usize, blo: usize, bhi: usize) -> usize {
    let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
    if size == 0 {
        return 0;
    }
    size + matching_chars(a, b, alo, i, blo, j) + matching_chars(a, b, i + size, ahi, j + size, bhi)
}

/// Longest common block in `a[alo..ahi]` × `b[blo..bhi]`; ties resolve to
/// the earliest start in `a`, then in `b`.
fn longest_match(a: &[char], b: &[char], alo: usize, ahi: usize, blo: usize, bhi: usize) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best) = (alo, blo, 0);
    // run[j] = length of the match ending at (i - 1, j - 1)
    let mut prev = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        let mut row = vec![0usize; bhi - blo + 1];
        for j in blo..bhi {
            if a[i] == b[j] {
                let k = prev[j - blo] + 1;
                row[j - blo + 1] = k;
                if k > best {
                    best = k;
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                }
            }
        }
        prev = row;
    }
    (best_i, best_j, best)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
