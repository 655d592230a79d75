//! Identity verification and attendance pipeline.
//!
//! Quality gate → face localizer → embedding → matcher → attendance recorder,
//! with the geofence gate first when coordinates are supplied. Every gate is a
//! hard stop: a failed gate returns [`Verdict::Rejected`] with a structured
//! reason, and nothing is written to storage. Only infrastructure failures
//! (undecodable input, embedding provider, storage) are [`PipelineError`]s.

use crate::attendance::{AttendanceAction, AttendanceEvent, LastAction};
use crate::geofence::{GeofencePolicy, GeofenceVerdict};
use crate::imaging::{self, DecodeError};
use crate::localizer::{Detection, FaceLocalizer};
use crate::matcher::IdentityMatcher;
use crate::quality::{QualityGate, QualityReport};
use crate::recognizer::{EmbeddingProvider, RecognizerError};
use crate::repository::{AttendanceRecorder, Identity, StoreError, TemplateStore};
use crate::types::{Embedding, EmbeddingError};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid identity handle {0:?}")]
    InvalidIdentity(String),
    #[error("embedding provider failed: {0}")]
    Embedding(#[from] RecognizerError),
    #[error("stored templates unusable: {0}")]
    Template(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Whether the caller sent bad input (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::InvalidIdentity(_))
    }
}

/// Why a request was turned away by a gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum Rejection {
    ImageQualityFailed { quality: QualityReport },
    FaceDetectionFailed { detection: Detection },
    VerificationFailed { identity: String, score: Option<f32> },
    LocationNotAllowed { location: GeofenceVerdict },
    /// The matched identity disappeared before the event could be recorded.
    IdentityNotFound { identity: String },
}

impl Rejection {
    pub fn message(&self) -> String {
        match self {
            Self::ImageQualityFailed { quality } => quality.message(),
            Self::FaceDetectionFailed { detection } => detection.message.clone(),
            Self::VerificationFailed { identity, .. } => {
                format!("could not verify '{identity}'; please try again")
            }
            Self::LocationNotAllowed { location } => location.message.clone(),
            Self::IdentityNotFound { identity } => format!("identity '{identity}' is not registered"),
        }
    }
}

/// Outcome of a gated operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Verdict<T> {
    pub fn accepted(self) -> Option<T> {
        match self {
            Self::Accepted(v) => Some(v),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(r) => Some(r),
        }
    }
}

/// Unwrap an accepted verdict or return the rejection from the enclosing fn.
macro_rules! pass {
    ($verdict:expr) => {
        match $verdict {
            Verdict::Accepted(v) => v,
            Verdict::Rejected(r) => return Ok(Verdict::Rejected(r)),
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub identity: String,
    pub embedding_count: usize,
    pub detection: Detection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub identity: String,
    pub verified: bool,
    /// `None` when the identity is unknown.
    pub score: Option<f32>,
    pub detection: Detection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceOutcome {
    pub recognized: bool,
    pub identity: Option<String>,
    pub score: Option<f32>,
    /// Present only when an event was written.
    pub event: Option<AttendanceEvent>,
    /// Rounded distance to the reference point, when coordinates were given.
    pub distance_m: Option<f64>,
    pub detection: Detection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityCheck {
    pub quality: QualityReport,
    pub detection: Detection,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedEmbedding {
    pub embedding: Embedding,
    pub quality: QualityReport,
    pub detection: Detection,
}

/// A gated face: the crop plus the diagnostics that let it through.
struct GatedFace {
    crop: RgbImage,
    quality: QualityReport,
    detection: Detection,
}

/// Similarity as a percentage with one decimal, for display.
pub fn similarity_percent(score: f32) -> f64 {
    (score as f64 * 1000.0).round() / 10.0
}

/// The full decision pipeline. Built once; models are reused across requests.
pub struct Pipeline<E, R> {
    quality: QualityGate,
    localizer: FaceLocalizer,
    embedder: E,
    repository: R,
    matcher: IdentityMatcher,
    geofence: GeofencePolicy,
}

impl<E, R> Pipeline<E, R>
where
    E: EmbeddingProvider,
    R: TemplateStore + AttendanceRecorder,
{
    pub fn new(
        quality: QualityGate,
        localizer: FaceLocalizer,
        embedder: E,
        repository: R,
        matcher: IdentityMatcher,
        geofence: GeofencePolicy,
    ) -> Self {
        Self { quality, localizer, embedder, repository, matcher, geofence }
    }

    pub fn quality_gate(&self) -> &QualityGate {
        &self.quality
    }

    pub fn localizer(&self) -> &FaceLocalizer {
        &self.localizer
    }

    pub fn matcher(&self) -> &IdentityMatcher {
        &self.matcher
    }

    pub fn geofence(&self) -> &GeofencePolicy {
        &self.geofence
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Add a template for `identity`, creating it on first registration.
    pub fn register(&mut self, identity: &str, image: &[u8]) -> Result<Verdict<Registration>, PipelineError> {
        let identity = validate_handle(identity)?;
        let face = pass!(self.gate(image)?);

        let embedding = self.embedder.embed(&face.crop)?;
        let embedding_count = self.repository.add_template(identity, &embedding)?;

        tracing::info!(identity, embedding_count, "template registered");

        Ok(Verdict::Accepted(Registration {
            identity: identity.to_string(),
            embedding_count,
            detection: face.detection,
        }))
    }

    /// 1:1 verification. A mismatch is an accepted outcome with `verified: false`.
    pub fn verify(&mut self, identity: &str, image: &[u8]) -> Result<Verdict<Verification>, PipelineError> {
        let identity = validate_handle(identity)?;
        let face = pass!(self.gate(image)?);

        let (verified, score) = self.verify_face(identity, &face.crop)?;

        Ok(Verdict::Accepted(Verification {
            identity: identity.to_string(),
            verified,
            score,
            detection: face.detection,
        }))
    }

    /// Identify the person (1:1 when `identity` is given, else 1:N) and record
    /// attendance on a match.
    ///
    /// With `location`, the geofence gate runs before the image is touched.
    pub fn recognize(
        &mut self,
        image: &[u8],
        action: AttendanceAction,
        identity: Option<&str>,
        location: Option<Coordinates>,
    ) -> Result<Verdict<AttendanceOutcome>, PipelineError> {
        let identity = identity.map(validate_handle).transpose()?;

        let distance_m = match location {
            Some(coords) => {
                let verdict = self.geofence.check(coords.latitude, coords.longitude);
                if !verdict.allowed {
                    tracing::info!(distance = verdict.distance_m, max = verdict.max_distance_m, "location denied");
                    return Ok(Verdict::Rejected(Rejection::LocationNotAllowed { location: verdict }));
                }
                Some(verdict.distance_m)
            }
            None => None,
        };

        let face = pass!(self.gate(image)?);

        let (matched, score) = match identity {
            Some(handle) => {
                let (verified, score) = self.verify_face(handle, &face.crop)?;
                if !verified {
                    return Ok(Verdict::Rejected(Rejection::VerificationFailed {
                        identity: handle.to_string(),
                        score,
                    }));
                }
                (handle.to_string(), score)
            }
            None => {
                let probe = self.embedder.embed(&face.crop)?;
                let gallery = self.repository.enrolled()?;
                let outcome = self.matcher.recognize(&probe, &gallery)?;
                tracing::debug!(enrolled = gallery.len(), score = ?outcome.score, "recognition scored");

                let Some(matched) = outcome.identity else {
                    tracing::info!(score = ?outcome.score, "face not recognized");
                    return Ok(Verdict::Accepted(AttendanceOutcome {
                        recognized: false,
                        identity: None,
                        score: outcome.score,
                        event: None,
                        distance_m,
                        detection: face.detection,
                    }));
                };
                (matched, outcome.score)
            }
        };

        // A match always carries a score.
        let score_value = score.unwrap_or_default();
        let Some(event) = self.repository.record(&matched, action, score_value)? else {
            tracing::warn!(identity = %matched, "identity vanished before attendance was recorded");
            return Ok(Verdict::Rejected(Rejection::IdentityNotFound { identity: matched }));
        };

        tracing::info!(
            identity = %matched,
            action = %action,
            score = score_value,
            period = event.period.as_str(),
            "attendance recorded"
        );

        Ok(Verdict::Accepted(AttendanceOutcome {
            recognized: true,
            identity: Some(matched),
            score,
            event: Some(event),
            distance_m,
            detection: face.detection,
        }))
    }

    /// Diagnostics only: quality gate and localizer, no matching, no writes.
    pub fn check_quality(&mut self, image: &[u8]) -> Result<QualityCheck, PipelineError> {
        let image = imaging::decode(image)?;
        let quality = self.quality.assess(&image);
        let (_, detection) = self.localizer.locate(&image);
        let passed = quality.passed && detection.found;
        Ok(QualityCheck { quality, detection, passed })
    }

    /// Run the gates and return the probe embedding without storing it.
    pub fn extract_embedding(&mut self, image: &[u8]) -> Result<Verdict<ExtractedEmbedding>, PipelineError> {
        let face = pass!(self.gate(image)?);
        let embedding = self.embedder.embed(&face.crop)?;
        Ok(Verdict::Accepted(ExtractedEmbedding {
            embedding,
            quality: face.quality,
            detection: face.detection,
        }))
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, PipelineError> {
        Ok(self.repository.identities()?)
    }

    pub fn last_action(&self, identity: &str) -> Result<Option<LastAction>, PipelineError> {
        Ok(self.repository.last_action(validate_handle(identity)?)?)
    }

    pub fn remove_identity(&mut self, identity: &str) -> Result<bool, PipelineError> {
        let identity = validate_handle(identity)?;
        let removed = self.repository.remove_identity(identity)?;
        tracing::info!(identity, removed, "remove identity");
        Ok(removed)
    }

    /// Decode, quality gate, localize.
    fn gate(&mut self, image: &[u8]) -> Result<Verdict<GatedFace>, PipelineError> {
        let image = imaging::decode(image)?;

        let quality = self.quality.assess(&image);
        if !quality.passed {
            tracing::info!(reasons = ?quality.reasons, "image rejected by quality gate");
            return Ok(Verdict::Rejected(Rejection::ImageQualityFailed { quality }));
        }

        let (crop, detection) = self.localizer.locate(&image);
        let Some(crop) = crop else {
            tracing::info!(face_count = detection.face_count, "image rejected: no face");
            return Ok(Verdict::Rejected(Rejection::FaceDetectionFailed { detection }));
        };

        Ok(Verdict::Accepted(GatedFace { crop, quality, detection }))
    }

    /// Compare a face crop against one identity's aggregate template.
    ///
    /// Unknown identities return `(false, None)` without running the embedder.
    fn verify_face(&mut self, identity: &str, crop: &RgbImage) -> Result<(bool, Option<f32>), PipelineError> {
        let templates = self.repository.templates(identity)?;
        if templates.is_empty() {
            tracing::info!(identity, "verify: identity has no templates");
            return Ok((false, None));
        }

        let probe = self.embedder.embed(crop)?;
        let outcome = self.matcher.verify(&probe, &templates)?;
        tracing::info!(identity, score = ?outcome.score, accepted = outcome.accepted, "verify scored");
        Ok((outcome.accepted, outcome.score))
    }
}

fn validate_handle(handle: &str) -> Result<&str, PipelineError> {
    let trimmed = handle.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidIdentity(handle.to_string()));
    }
    Ok(trimmed)
}
