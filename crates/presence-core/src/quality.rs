//! Image quality gate: brightness, sharpness and contrast heuristics.
//!
//! All three checks run on the BT.601 grayscale plane and are independent of
//! one another. The gate passes only when every check passes.

use crate::imaging;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

const DEFAULT_BRIGHTNESS_MIN: f64 = 40.0;
const DEFAULT_BRIGHTNESS_MAX: f64 = 220.0;
const DEFAULT_BLUR_THRESHOLD: f64 = 30.0;
const DEFAULT_CONTRAST_MIN: f64 = 30.0;

/// Quality thresholds. Values are on the 0–255 grayscale scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub brightness_min: f64,
    pub brightness_max: f64,
    /// Minimum Laplacian variance. Higher variance = sharper image.
    pub blur_threshold: f64,
    pub contrast_min: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            brightness_min: DEFAULT_BRIGHTNESS_MIN,
            brightness_max: DEFAULT_BRIGHTNESS_MAX,
            blur_threshold: DEFAULT_BLUR_THRESHOLD,
            contrast_min: DEFAULT_CONTRAST_MIN,
        }
    }
}

/// Outcome of a single quality check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub passed: bool,
    pub value: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityChecks {
    pub brightness: CheckResult,
    pub blur: CheckResult,
    pub contrast: CheckResult,
}

/// Full quality report for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub passed: bool,
    pub checks: QualityChecks,
    /// Messages of every failed check, in brightness, blur, contrast order.
    pub reasons: Vec<String>,
}

impl QualityReport {
    pub fn message(&self) -> String {
        if self.passed {
            "image quality passed all checks".to_string()
        } else {
            format!("image quality failed: {}", self.reasons.join("; "))
        }
    }
}

/// Stateless quality gate. A pure function of pixel data and thresholds.
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn assess(&self, image: &RgbImage) -> QualityReport {
        let gray = imaging::grayscale(image);
        let stats = GrayStats::measure(&gray);

        let checks = QualityChecks {
            brightness: check_brightness(stats.mean, &self.config),
            blur: check_blur(laplacian_variance(&gray), &self.config),
            contrast: check_contrast(stats.std_dev, &self.config),
        };

        let reasons: Vec<String> = [&checks.brightness, &checks.blur, &checks.contrast]
            .into_iter()
            .filter(|c| !c.passed)
            .map(|c| c.message.clone())
            .collect();

        let report = QualityReport {
            passed: reasons.is_empty(),
            checks,
            reasons,
        };

        tracing::debug!(
            passed = report.passed,
            brightness = report.checks.brightness.value,
            sharpness = report.checks.blur.value,
            contrast = report.checks.contrast.value,
            "quality assessed"
        );

        report
    }
}

pub fn check_brightness(value: f64, config: &QualityConfig) -> CheckResult {
    if value < config.brightness_min {
        return CheckResult {
            passed: false,
            value,
            message: format!(
                "image is too dark (brightness {value:.1}, required >= {})",
                config.brightness_min
            ),
        };
    }
    if value > config.brightness_max {
        return CheckResult {
            passed: false,
            value,
            message: format!(
                "image is too bright (brightness {value:.1}, required <= {})",
                config.brightness_max
            ),
        };
    }
    CheckResult { passed: true, value, message: "brightness ok".to_string() }
}

pub fn check_blur(value: f64, config: &QualityConfig) -> CheckResult {
    if value < config.blur_threshold {
        return CheckResult {
            passed: false,
            value,
            message: format!(
                "image is too blurry (sharpness {value:.1}, required >= {})",
                config.blur_threshold
            ),
        };
    }
    CheckResult { passed: true, value, message: "sharpness ok".to_string() }
}

pub fn check_contrast(value: f64, config: &QualityConfig) -> CheckResult {
    if value < config.contrast_min {
        return CheckResult {
            passed: false,
            value,
            message: format!(
                "image contrast is too low (contrast {value:.1}, required >= {})",
                config.contrast_min
            ),
        };
    }
    CheckResult { passed: true, value, message: "contrast ok".to_string() }
}

/// Mean and population standard deviation of a grayscale plane.
struct GrayStats {
    mean: f64,
    std_dev: f64,
}

impl GrayStats {
    fn measure(gray: &GrayImage) -> Self {
        let n = gray.as_raw().len();
        if n == 0 {
            return Self { mean: 0.0, std_dev: 0.0 };
        }
        let mean = gray.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n as f64;
        let var = gray
            .as_raw()
            .iter()
            .map(|&p| (p as f64 - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        Self { mean, std_dev: var.sqrt() }
    }
}

/// Variance of the 4-neighbour Laplacian (kernel `[0 1 0; 1 -4 1; 0 1 0]`).
///
/// Borders are reflected without repeating the edge pixel (`dcb|abcd|cba`).
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w == 0 || h == 0 {
        return 0.0;
    }

    let px = |x: i64, y: i64| -> f64 { gray.get_pixel(reflect_101(x, w), reflect_101(y, h)).0[0] as f64 };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = (w * h) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn reflect_101(i: i64, len: i64) -> u32 {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = i.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn checkerboard(w: u32, h: u32, a: u8, b: u8) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = if (x + y) % 2 == 0 { a } else { b };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_brightness_boundaries() {
        let cfg = QualityConfig::default();
        assert!(!check_brightness(39.9, &cfg).passed);
        assert!(check_brightness(40.0, &cfg).passed);
        assert!(check_brightness(220.0, &cfg).passed);
        assert!(!check_brightness(220.1, &cfg).passed);
    }

    #[test]
    fn test_blur_boundaries() {
        let cfg = QualityConfig::default();
        assert!(!check_blur(29.9, &cfg).passed);
        assert!(check_blur(30.0, &cfg).passed);
    }

    #[test]
    fn test_contrast_boundaries() {
        let cfg = QualityConfig::default();
        assert!(!check_contrast(29.9, &cfg).passed);
        assert!(check_contrast(30.0, &cfg).passed);
    }

    #[test]
    fn test_sharp_image_passes() {
        let report = QualityGate::default().assess(&checkerboard(32, 32, 60, 180));
        assert!(report.passed, "{:?}", report.reasons);
        assert!(report.reasons.is_empty());
        assert!((report.checks.brightness.value - 120.0).abs() < 1e-9);
        assert!((report.checks.contrast.value - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_image_fails_blur_and_contrast_in_order() {
        let flat = RgbImage::from_pixel(16, 16, Rgb([128, 128, 128]));
        let report = QualityGate::default().assess(&flat);
        assert!(!report.passed);
        assert!(report.checks.brightness.passed);
        assert!(!report.checks.blur.passed);
        assert!(!report.checks.contrast.passed);
        assert_eq!(report.reasons.len(), 2);
        assert!(report.reasons[0].contains("blurry"));
        assert!(report.reasons[1].contains("contrast"));
    }

    #[test]
    fn test_dark_image_reports_all_failures() {
        let dark = RgbImage::from_pixel(16, 16, Rgb([5, 5, 5]));
        let report = QualityGate::default().assess(&dark);
        assert!(!report.passed);
        assert_eq!(report.reasons.len(), 3);
        assert!(report.reasons[0].contains("too dark"));
        assert!(report.message().starts_with("image quality failed"));
    }

    #[test]
    fn test_passed_iff_no_reasons() {
        let gate = QualityGate::default();
        for img in [
            checkerboard(20, 20, 60, 180),
            checkerboard(20, 20, 250, 255),
            RgbImage::from_pixel(10, 10, Rgb([100, 100, 100])),
        ] {
            let report = gate.assess(&img);
            assert_eq!(report.passed, report.reasons.is_empty());
        }
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        let gray = GrayImage::from_pixel(9, 7, Luma([77]));
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[test]
    fn test_laplacian_single_spike() {
        // 3x3 with a single bright centre; reflection mirrors the border row/col.
        let mut gray = GrayImage::from_pixel(3, 3, Luma([0]));
        gray.put_pixel(1, 1, Luma([9]));
        // centre: -36, edge-centres: 9 + 9 (reflected) = 18, corners: 0
        let values = [0.0, 18.0, 0.0, 18.0, -36.0, 18.0, 0.0, 18.0, 0.0];
        let mean = values.iter().sum::<f64>() / 9.0;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 9.0;
        assert!((laplacian_variance(&gray) - var).abs() < 1e-9);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-1, 1), 0);
    }
}
