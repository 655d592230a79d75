//! Classical frontal-face cascade (SeetaFace funnel-structured cascade).
//!
//! Fast and model-light; used first in the localizer chain. It reports no
//! calibrated confidence, so every box carries confidence 1.0.

use crate::detector::{DetectorError, FaceDetector};
use crate::imaging;
use crate::types::BoundingBox;
use image::RgbImage;
use rustface::ImageData;
use std::path::Path;

const CASCADE_MIN_FACE_SIZE: u32 = 30;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

pub struct CascadeDetector {
    inner: Box<dyn rustface::Detector>,
}

impl CascadeDetector {
    /// Load a SeetaFace frontal model (e.g. `seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let mut inner = rustface::create_detector(model_path).map_err(|e| DetectorError::ModelLoad {
            path: model_path.to_string(),
            reason: e.to_string(),
        })?;
        inner.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        inner.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        inner.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        inner.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        tracing::info!(path = model_path, "loaded cascade face model");

        Ok(Self { inner })
    }
}

impl FaceDetector for CascadeDetector {
    fn name(&self) -> &'static str {
        "cascade"
    }

    /// `threshold` is ignored: the cascade has its own fixed score cut-off.
    fn detect(&mut self, image: &RgbImage, _threshold: f32) -> Result<Vec<BoundingBox>, DetectorError> {
        let gray = imaging::grayscale(image);
        let mut data = ImageData::new(gray.as_raw(), gray.width(), gray.height());

        let faces = self
            .inner
            .detect(&mut data)
            .into_iter()
            .map(|face| {
                let rect = face.bbox();
                BoundingBox {
                    x: rect.x() as f32,
                    y: rect.y() as f32,
                    width: rect.width() as f32,
                    height: rect.height() as f32,
                    confidence: 1.0,
                }
            })
            .collect();

        Ok(faces)
    }
}
