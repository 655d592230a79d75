//! Face localizer: ordered detector fallback, dominant-face selection, crop.

use crate::detector::FaceDetector;
use crate::imaging;
use crate::types::{BoundingBox, FaceRegion};
use image::RgbImage;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_CROP_MARGIN: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Minimum detector confidence passed to every detector.
    pub confidence_threshold: f32,
    /// Crop margin as a fraction of the face box, added on each side.
    pub crop_margin: f32,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            crop_margin: DEFAULT_CROP_MARGIN,
        }
    }
}

/// Detection diagnostics returned alongside (or instead of) a face crop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub found: bool,
    pub face_count: usize,
    pub message: String,
    /// Selected face box, clamped to the image, before margin is applied.
    pub bbox: Option<FaceRegion>,
    pub confidence: Option<f32>,
    /// Name of the detector that produced the faces.
    pub detector: Option<&'static str>,
    pub multiple_faces: bool,
}

impl Detection {
    fn not_found() -> Self {
        Self {
            found: false,
            face_count: 0,
            message: "no face found in image".to_string(),
            bbox: None,
            confidence: None,
            detector: None,
            multiple_faces: false,
        }
    }
}

/// Runs detectors in order until one yields a face, then crops the largest.
pub struct FaceLocalizer {
    detectors: Vec<Box<dyn FaceDetector>>,
    config: LocalizerConfig,
}

impl FaceLocalizer {
    /// `detectors` are tried in order; put the fast classical detector first.
    pub fn new(detectors: Vec<Box<dyn FaceDetector>>, config: LocalizerConfig) -> Self {
        Self { detectors, config }
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    /// Detector names in the order they are tried.
    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Locate the dominant face and crop it with margin.
    ///
    /// Never fails: a detector error counts as zero detections and the next
    /// detector is tried, once.
    pub fn locate(&mut self, image: &RgbImage) -> (Option<RgbImage>, Detection) {
        let Some((detector, faces)) = self.run_chain(image) else {
            tracing::debug!("no face found by any detector");
            return (None, Detection::not_found());
        };

        let face_count = faces.len();
        let (region, confidence) = select_largest(&faces);
        let (crop, _) = imaging::crop_with_margin(image, &region, self.config.crop_margin);

        let multiple_faces = face_count > 1;
        let message = if multiple_faces {
            tracing::info!(face_count, "multiple faces found; using the largest");
            format!("found {face_count} faces; retake the photo with a single face")
        } else {
            "face detected".to_string()
        };

        tracing::debug!(
            detector,
            face_count,
            confidence,
            x1 = region.x1,
            y1 = region.y1,
            x2 = region.x2,
            y2 = region.y2,
            "face selected"
        );

        let detection = Detection {
            found: true,
            face_count,
            message,
            bbox: Some(region),
            confidence: Some(confidence),
            detector: Some(detector),
            multiple_faces,
        };
        (Some(crop), detection)
    }

    /// First detector with at least one usable (in-bounds, non-empty) face.
    fn run_chain(&mut self, image: &RgbImage) -> Option<(&'static str, Vec<(FaceRegion, f32)>)> {
        let threshold = self.config.confidence_threshold;

        for detector in self.detectors.iter_mut() {
            let boxes: Vec<BoundingBox> = match detector.detect(image, threshold) {
                Ok(boxes) => boxes,
                Err(err) => {
                    tracing::warn!(
                        detector = detector.name(),
                        error = %err,
                        "detector failed; treating as no detections"
                    );
                    continue;
                }
            };

            let faces: Vec<(FaceRegion, f32)> = boxes
                .iter()
                .filter_map(|b| {
                    FaceRegion::from_bbox(b, image.width(), image.height()).map(|r| (r, b.confidence))
                })
                .collect();

            if !faces.is_empty() {
                return Some((detector.name(), faces));
            }
            tracing::debug!(detector = detector.name(), "no faces; falling back to next detector");
        }

        None
    }
}

/// Largest area wins; ties keep the first-encountered face.
fn select_largest(faces: &[(FaceRegion, f32)]) -> (FaceRegion, f32) {
    let mut best = faces[0];
    for &face in &faces[1..] {
        if face.0.area() > best.0.area() {
            best = face;
        }
    }
    best
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use image::Rgb;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Detector returning a fixed answer, counting how often it was called.
    pub(crate) struct ScriptedDetector {
        pub name: &'static str,
        pub result: Result<Vec<BoundingBox>, String>,
        pub calls: Rc<Cell<usize>>,
    }

    impl ScriptedDetector {
        pub(crate) fn boxes(name: &'static str, boxes: Vec<BoundingBox>) -> Self {
            Self { name, result: Ok(boxes), calls: Rc::new(Cell::new(0)) }
        }

        pub(crate) fn failing(name: &'static str) -> Self {
            Self { name, result: Err("session crashed".into()), calls: Rc::new(Cell::new(0)) }
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn detect(&mut self, _image: &RgbImage, _threshold: f32) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.set(self.calls.get() + 1);
            self.result.clone().map_err(DetectorError::InferenceFailed)
        }
    }

    pub(crate) fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(200, 200, Rgb([90, 90, 90]))
    }

    #[test]
    fn test_primary_result_skips_fallback() {
        let primary = ScriptedDetector::boxes("primary", vec![bbox(50.0, 50.0, 100.0, 100.0, 1.0)]);
        let fallback = ScriptedDetector::boxes("fallback", vec![bbox(0.0, 0.0, 10.0, 10.0, 0.9)]);
        let fallback_calls = fallback.calls.clone();

        let mut localizer = FaceLocalizer::new(vec![Box::new(primary), Box::new(fallback)], LocalizerConfig::default());
        let (crop, det) = localizer.locate(&image());

        assert!(det.found);
        assert_eq!(det.face_count, 1);
        assert_eq!(det.detector, Some("primary"));
        assert_eq!(det.confidence, Some(1.0));
        assert_eq!(det.bbox, Some(FaceRegion { x1: 50, y1: 50, x2: 150, y2: 150 }));
        assert_eq!(crop.unwrap().dimensions(), (140, 140));
        assert_eq!(fallback_calls.get(), 0);
        assert!(!det.multiple_faces);
    }

    #[test]
    fn test_fallback_used_when_primary_empty() {
        let primary = ScriptedDetector::boxes("primary", vec![]);
        let fallback = ScriptedDetector::boxes("fallback", vec![bbox(10.0, 20.0, 40.0, 60.0, 0.87)]);

        let mut localizer = FaceLocalizer::new(vec![Box::new(primary), Box::new(fallback)], LocalizerConfig::default());
        let (crop, det) = localizer.locate(&image());

        assert!(det.found);
        assert_eq!(det.detector, Some("fallback"));
        assert_eq!(det.confidence, Some(0.87));
        assert_eq!(crop.unwrap().dimensions(), (56, 84));
    }

    #[test]
    fn test_fallback_failure_is_not_found() {
        let primary = ScriptedDetector::boxes("primary", vec![]);
        let fallback = ScriptedDetector::failing("fallback");
        let calls = fallback.calls.clone();

        let mut localizer = FaceLocalizer::new(vec![Box::new(primary), Box::new(fallback)], LocalizerConfig::default());
        let (crop, det) = localizer.locate(&image());

        assert!(crop.is_none());
        assert!(!det.found);
        assert_eq!(det.face_count, 0);
        assert_eq!(det.message, "no face found in image");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_two_faces_picks_larger_with_warning() {
        let primary = ScriptedDetector::boxes(
            "primary",
            vec![bbox(0.0, 0.0, 30.0, 30.0, 1.0), bbox(100.0, 100.0, 80.0, 60.0, 1.0)],
        );
        let mut localizer = FaceLocalizer::new(vec![Box::new(primary)], LocalizerConfig::default());
        let (crop, det) = localizer.locate(&image());

        assert!(det.found);
        assert_eq!(det.face_count, 2);
        assert!(det.multiple_faces);
        assert!(det.message.contains("2 faces"));
        assert_eq!(det.bbox, Some(FaceRegion { x1: 100, y1: 100, x2: 180, y2: 160 }));
        // margin 16 x 12 around the larger face
        assert_eq!(crop.unwrap().dimensions(), (196 - 84, 172 - 88));
    }

    #[test]
    fn test_equal_area_tie_keeps_first() {
        let primary = ScriptedDetector::boxes(
            "primary",
            vec![bbox(10.0, 10.0, 40.0, 40.0, 0.6), bbox(100.0, 100.0, 40.0, 40.0, 0.9)],
        );
        let mut localizer = FaceLocalizer::new(vec![Box::new(primary)], LocalizerConfig::default());
        let (_, det) = localizer.locate(&image());
        assert_eq!(det.bbox, Some(FaceRegion { x1: 10, y1: 10, x2: 50, y2: 50 }));
        assert_eq!(det.confidence, Some(0.6));
    }

    #[test]
    fn test_out_of_bounds_boxes_fall_through() {
        let primary = ScriptedDetector::boxes("primary", vec![bbox(500.0, 500.0, 20.0, 20.0, 1.0)]);
        let fallback = ScriptedDetector::boxes("fallback", vec![bbox(20.0, 20.0, 50.0, 50.0, 0.7)]);
        let mut localizer = FaceLocalizer::new(vec![Box::new(primary), Box::new(fallback)], LocalizerConfig::default());
        let (_, det) = localizer.locate(&image());
        assert_eq!(det.detector, Some("fallback"));
        assert_eq!(det.face_count, 1);
    }

    #[test]
    fn test_deterministic_selection() {
        let boxes = vec![bbox(5.0, 5.0, 60.0, 70.0, 1.0), bbox(90.0, 40.0, 70.0, 60.0, 1.0)];
        let mut a = FaceLocalizer::new(vec![Box::new(ScriptedDetector::boxes("p", boxes.clone()))], LocalizerConfig::default());
        let mut b = FaceLocalizer::new(vec![Box::new(ScriptedDetector::boxes("p", boxes))], LocalizerConfig::default());
        let (crop_a, det_a) = a.locate(&image());
        let (crop_b, det_b) = b.locate(&image());
        assert_eq!(det_a, det_b);
        assert_eq!(crop_a, crop_b);
    }
}
