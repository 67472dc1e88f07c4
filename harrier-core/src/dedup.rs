//! Near-duplicate detection over recorded findings.
//!
//! Agents working different corners of the same target routinely rediscover
//! the same issue. A periodic sweep compares finding pairs and marks the
//! later recording as a duplicate of the earlier one, so summaries and
//! reports count each issue once.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::store::{Finding, FindingFilter, FindingStatus, KnowledgeStore};

/// Minimum pair score treated as the same underlying issue
pub const DEFAULT_THRESHOLD: f64 = 0.85;

/// Pairwise finding similarity in [0, 1].
///
/// The baseline scorer is lexical; a semantic scorer can slot in here
/// without touching the sweep.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &Finding, b: &Finding) -> f64;
}

/// Lexical scorer: findings must share target and class, then titles (and
/// details when both are present) are compared by normalized edit distance.
///
/// Identical generic titles with clearly different details score below the
/// default threshold, so two distinct injection points sharing a title stay
/// separate findings.
#[derive(Debug, Default)]
pub struct BaselineScorer;

impl SimilarityScorer for BaselineScorer {
    fn score(&self, a: &Finding, b: &Finding) -> f64 {
        if a.target_id != b.target_id || a.class != b.class {
            return 0.0;
        }
        let title = similarity(&normalize(&a.title), &normalize(&b.title));
        match (a.detail.as_deref(), b.detail.as_deref()) {
            (Some(da), Some(db)) if !da.trim().is_empty() && !db.trim().is_empty() => {
                0.7 * title + 0.3 * similarity(&normalize(da), &normalize(db))
            }
            _ => title,
        }
    }
}

/// Sweeps a target's findings and records duplicate links in the store. The
/// earliest recording of an issue stays canonical.
pub struct Deduplicator {
    store: Arc<KnowledgeStore>,
    scorer: Box<dyn SimilarityScorer>,
    threshold: f64,
}

impl Deduplicator {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self {
            store,
            scorer: Box::new(BaselineScorer),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Replace the pair scorer
    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Override the duplicate threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Compare every finding pair for `target_id` and mark near-duplicates.
    /// Returns how many findings were newly marked.
    pub async fn sweep(&self, target_id: &str) -> Result<usize> {
        let findings = self
            .store
            .query_findings(FindingFilter {
                target_id: Some(target_id.to_string()),
                ..FindingFilter::default()
            })
            .await?;

        // Query order is oldest first, so the first non-duplicate in a
        // cluster becomes the canonical record.
        let mut duplicates: HashSet<String> = findings
            .iter()
            .filter(|f| f.status == FindingStatus::Duplicate)
            .map(|f| f.id.clone())
            .collect();
        let mut marked = 0;

        for (i, canonical) in findings.iter().enumerate() {
            if duplicates.contains(&canonical.id) {
                continue;
            }
            for candidate in findings.iter().skip(i + 1) {
                if duplicates.contains(&candidate.id) {
                    continue;
                }
                let score = self.scorer.score(canonical, candidate);
                if score >= self.threshold {
                    self.store
                        .mark_duplicate(&candidate.id, &canonical.id)
                        .await?;
                    duplicates.insert(candidate.id.clone());
                    marked += 1;
                    debug!(
                        canonical = %canonical.id,
                        duplicate = %candidate.id,
                        score,
                        "marked near-duplicate finding"
                    );
                }
            }
        }

        if marked > 0 {
            info!(target_id, marked, "deduplication sweep complete");
        }
        Ok(marked)
    }
}

/// Lowercase and collapse whitespace runs so formatting differences do not
/// count as edits
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity ratio in [0, 1] from edit distance
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Two-row Levenshtein distance over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let m = a_chars.len();
    let n = b_chars.len();

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            curr[j + 1] = (prev[j + 1] + 1)
                .min(curr[j] + 1)
                .min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}
