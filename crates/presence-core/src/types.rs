use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of every embedding template produced by the recognizer.
pub const EMBEDDING_DIM: usize = 512;

/// Allowed deviation of a template's Euclidean norm from 1.0.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence. Classical detectors report 1.0.
    pub confidence: f32,
}

/// Integer face region clamped to image bounds, as `[x1, y1)` .. `[x2, y2)`.
///
/// Serialized as the array `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[u32; 4]", try_from = "[u32; 4]")]
pub struct FaceRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FaceRegion {
    /// Clamp a detector box to a `width` x `height` image.
    ///
    /// Returns `None` when nothing of the box survives clamping.
    pub fn from_bbox(bbox: &BoundingBox, width: u32, height: u32) -> Option<Self> {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() {
                0
            } else {
                (v.trunc().max(0.0) as u32).min(max)
            }
        };
        let x1 = clamp(bbox.x, width);
        let y1 = clamp(bbox.y, height);
        let x2 = clamp(bbox.x + bbox.width, width);
        let y2 = clamp(bbox.y + bbox.height, height);

        (x2 > x1 && y2 > y1).then_some(Self { x1, y1, x2, y2 })
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

impl From<FaceRegion> for [u32; 4] {
    fn from(r: FaceRegion) -> Self {
        [r.x1, r.y1, r.x2, r.y2]
    }
}

impl TryFrom<[u32; 4]> for FaceRegion {
    type Error = String;

    fn try_from([x1, y1, x2, y2]: [u32; 4]) -> Result<Self, Self::Error> {
        if x2 > x1 && y2 > y1 {
            Ok(Self { x1, y1, x2, y2 })
        } else {
            Err(format!("empty face region [{x1}, {y1}, {x2}, {y2}]"))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongDimension(usize),
    #[error("embedding has zero norm and cannot be normalized")]
    ZeroNorm,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("stored embedding is not unit length (norm {0})")]
    NotUnit(f32),
}

/// L2-normalized face embedding (512-dimensional for ArcFace).
///
/// Normalization happens once, at construction. Comparison assumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_mbf").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build a template from raw model output, normalizing it to unit length.
    pub fn new(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension(raw.len()));
        }
        Self::normalized(raw)
    }

    /// Wrap values that are already unit length (e.g. read back from storage).
    ///
    /// Rejects vectors whose norm is outside [`UNIT_NORM_TOLERANCE`].
    pub fn from_unit(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let embedding = Self { values, model_version: None };
        if !embedding.is_unit() {
            return Err(EmbeddingError::NotUnit(embedding.norm()));
        }
        Ok(embedding)
    }

    /// Element-wise mean of `templates`, re-normalized to unit length.
    ///
    /// Returns `None` for an empty set. The result does not depend on the
    /// order of `templates` beyond floating-point rounding.
    pub fn aggregate(templates: &[Embedding]) -> Option<Result<Embedding, EmbeddingError>> {
        let first = templates.first()?;
        let dim = first.values.len();
        let mut sum = vec![0.0f64; dim];
        for template in templates {
            if template.values.len() != dim {
                return Some(Err(EmbeddingError::WrongDimension(template.values.len())));
            }
            for (acc, v) in sum.iter_mut().zip(&template.values) {
                *acc += *v as f64;
            }
        }
        let count = templates.len() as f64;
        let mean: Vec<f32> = sum.into_iter().map(|s| (s / count) as f32).collect();

        Some(Self::normalized(mean).map(|mut e| {
            e.model_version = first.model_version.clone();
            e
        }))
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn is_unit(&self) -> bool {
        (self.norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Cosine similarity between two unit embeddings: their dot product.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }

    fn normalized(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let norm = l2_norm(&raw);
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(Self {
            values: raw.into_iter().map(|x| x / norm).collect(),
            model_version: None,
        })
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values
        .iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}
