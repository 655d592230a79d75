//! Identity matching against aggregate templates: 1:1 verify and 1:N recognize.

use crate::repository::EnrolledIdentity;
use crate::types::{Embedding, EmbeddingError};
use serde::Serialize;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of a 1:1 verification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerifyOutcome {
    pub accepted: bool,
    /// `None` when the identity has no templates (unknown, not a mismatch).
    pub score: Option<f32>,
}

/// Result of a 1:N recognition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizeOutcome {
    /// Best identity, only when its score reaches the threshold.
    pub identity: Option<String>,
    /// Best score seen, reported even below the threshold. `None` when
    /// nothing is enrolled.
    pub score: Option<f32>,
}

/// Cosine matcher over per-identity aggregate templates.
///
/// Aggregates are recomputed from the supplied templates on every call.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    threshold: f32,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl IdentityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Whether `score` passes. The threshold itself passes.
    pub fn accepts(&self, score: f32) -> bool {
        score >= self.threshold
    }

    /// Compare `probe` against the aggregate of one identity's templates.
    pub fn verify(&self, probe: &Embedding, templates: &[Embedding]) -> Result<VerifyOutcome, EmbeddingError> {
        let Some(aggregate) = Embedding::aggregate(templates) else {
            return Ok(VerifyOutcome { accepted: false, score: None });
        };
        let score = probe.similarity(&aggregate?);
        Ok(VerifyOutcome { accepted: self.accepts(score), score: Some(score) })
    }

    /// Score `probe` against every enrolled identity and pick the best.
    ///
    /// Identities are visited in lexicographic handle order and every one is
    /// scored (no early exit). On equal scores the lexicographically first
    /// handle wins. Identities without templates are skipped.
    pub fn recognize(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledIdentity],
    ) -> Result<RecognizeOutcome, EmbeddingError> {
        let mut ordered: Vec<&EnrolledIdentity> = gallery.iter().collect();
        ordered.sort_by(|a, b| a.handle.cmp(&b.handle));

        let mut best: Option<(&str, f32)> = None;
        for identity in ordered {
            let Some(aggregate) = Embedding::aggregate(&identity.templates) else {
                continue;
            };
            let score = probe.similarity(&aggregate?);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((&identity.handle, score));
            }
        }

        Ok(match best {
            Some((handle, score)) if self.accepts(score) => RecognizeOutcome {
                identity: Some(handle.to_string()),
                score: Some(score),
            },
            Some((_, score)) => RecognizeOutcome { identity: None, score: Some(score) },
            None => RecognizeOutcome { identity: None, score: None },
        })
    }
}
