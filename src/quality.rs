// 🔍 Image Quality Engine - Deterministic Pre-Extraction Scoring
// Scores a decoded grayscale raster before enhancement. Raster decoding itself
// is a collaborator concern; this module owns the math and the enhancement plan.
//
// Composite score = 0.4·sharpness + 0.3·brightness-closeness + 0.3·contrast,
// each component normalized to 0-1. Low quality warns, never hard-fails.

use serde::{Deserialize, Serialize};

// ============================================================================
// GRAYSCALE RASTER
// ============================================================================

/// Minimal grayscale buffer handed over by the decoding collaborator.
/// Row-major, one byte per pixel.
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Option<GrayImage> {
        if width == 0 || height == 0 || pixels.len() != width * height {
            return None;
        }
        Some(GrayImage {
            width,
            height,
            pixels,
        })
    }

    /// Binary PGM (P5, maxval <= 255) loader. The one raster format the
    /// pipeline decodes itself; anything else arrives pre-decoded.
    pub fn from_pgm(bytes: &[u8]) -> Option<GrayImage> {
        if !bytes.starts_with(b"P5") {
            return None;
        }
        let mut pos = 2;
        let mut header = [0usize; 3];
        let mut filled = 0;

        while filled < 3 && pos < bytes.len() {
            // Skip whitespace and '#' comment lines between header tokens
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos < bytes.len() && bytes[pos] == b'#' {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                continue;
            }
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == start {
                return None;
            }
            header[filled] = std::str::from_utf8(&bytes[start..pos]).ok()?.parse().ok()?;
            filled += 1;
        }

        let (width, height, maxval) = (header[0], header[1], header[2]);
        if filled < 3 || maxval == 0 || maxval > 255 {
            return None;
        }
        // Exactly one whitespace byte separates the header from the raster
        pos += 1;
        let pixels = bytes.get(pos..pos + width.checked_mul(height)?)?.to_vec();
        GrayImage::new(width, height, pixels)
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f64 {
        self.pixels[y * self.width + x] as f64
    }
}

// ============================================================================
// QUALITY ASSESSMENT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Composite 0-1 score
    pub score: f64,

    /// Raw measurements
    pub blur_variance: f64,
    pub brightness_mean: f64,
    pub contrast_std: f64,

    /// Normalized components
    pub sharpness_score: f64,
    pub brightness_score: f64,
    pub contrast_score: f64,

    /// Axis-specific warnings ("high blur", "low brightness", "low contrast")
    pub warnings: Vec<String>,
}

// ============================================================================
// ENHANCEMENT PLAN
// ============================================================================

/// Ordered enhancement pipeline the preprocessor executes before extraction:
/// denoise → contrast normalize → skew correct → threshold → border.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum EnhancementStep {
    Denoise,
    NormalizeContrast { clip_limit: f64, grid_size: u32 },
    CorrectSkew { angle_degrees: f64 },
    Threshold { block_size: u32, offset: i32 },
    AddBorder { pixels: u32 },
}

// ============================================================================
// QUALITY ENGINE
// ============================================================================

pub struct QualityEngine {
    /// Laplacian variance at or above this maps to sharpness 1.0
    pub blur_scale: f64,

    /// Intensity spread at or above this maps to contrast 1.0
    pub contrast_scale: f64,

    /// Raw-measurement floors that attach warnings
    pub blur_warn_floor: f64,
    pub brightness_warn_floor: f64,
    pub contrast_warn_floor: f64,

    /// Skew below this magnitude is left alone
    pub min_skew_degrees: f64,
}

impl QualityEngine {
    pub fn new() -> Self {
        QualityEngine {
            blur_scale: 150.0,
            contrast_scale: 64.0,
            blur_warn_floor: 50.0,
            brightness_warn_floor: 60.0,
            contrast_warn_floor: 30.0,
            min_skew_degrees: 0.3,
        }
    }

    /// Score a grayscale raster. Deterministic: same pixels, same score.
    pub fn assess(&self, image: &GrayImage) -> QualityAssessment {
        let blur_variance = laplacian_variance(image);
        let (brightness_mean, contrast_std) = mean_and_std(&image.pixels);

        let sharpness_score = (blur_variance / self.blur_scale).min(1.0);
        let brightness_score = 1.0 - ((brightness_mean - 127.0).abs() / 127.0).min(1.0);
        let contrast_score = (contrast_std / self.contrast_scale).min(1.0);

        let score = 0.4 * sharpness_score + 0.3 * brightness_score + 0.3 * contrast_score;

        let mut warnings = Vec::new();
        if blur_variance < self.blur_warn_floor {
            warnings.push(format!(
                "high blur: laplacian variance {:.1} below {:.0}",
                blur_variance, self.blur_warn_floor
            ));
        }
        if brightness_mean < self.brightness_warn_floor {
            warnings.push(format!(
                "low brightness: mean {:.1} below {:.0}",
                brightness_mean, self.brightness_warn_floor
            ));
        }
        if contrast_std < self.contrast_warn_floor {
            warnings.push(format!(
                "low contrast: spread {:.1} below {:.0}",
                contrast_std, self.contrast_warn_floor
            ));
        }

        QualityAssessment {
            score,
            blur_variance,
            brightness_mean,
            contrast_std,
            sharpness_score,
            brightness_score,
            contrast_score,
            warnings,
        }
    }

    /// Build the enhancement plan for a scored image. Skew correction is
    /// dropped when the estimated angle is below the floor.
    pub fn plan_enhancement(&self, estimated_skew_degrees: f64) -> Vec<EnhancementStep> {
        let mut steps = vec![
            EnhancementStep::Denoise,
            EnhancementStep::NormalizeContrast {
                clip_limit: 2.0,
                grid_size: 8,
            },
        ];
        if estimated_skew_degrees.abs() >= self.min_skew_degrees {
            steps.push(EnhancementStep::CorrectSkew {
                angle_degrees: estimated_skew_degrees,
            });
        }
        steps.push(EnhancementStep::Threshold {
            block_size: 31,
            offset: 8,
        });
        steps.push(EnhancementStep::AddBorder { pixels: 8 });
        steps
    }
}

impl Default for QualityEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MEASUREMENTS
// ============================================================================

/// Variance of the 4-neighbor Laplacian response over interior pixels.
/// Flat scans produce near-zero variance; crisp text produces large values.
fn laplacian_variance(image: &GrayImage) -> f64 {
    if image.width < 3 || image.height < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity((image.width - 2) * (image.height - 2));
    for y in 1..image.height - 1 {
        for x in 1..image.width - 1 {
            let response = 4.0 * image.at(x, y)
                - image.at(x - 1, y)
                - image.at(x + 1, y)
                - image.at(x, y - 1)
                - image.at(x, y + 1);
            responses.push(response);
        }
    }

    let mean = responses.iter().sum::<f64>() / responses.len() as f64;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / responses.len() as f64
}

fn mean_and_std(pixels: &[u8]) -> (f64, f64) {
    if pixels.is_empty() {
        return (0.0, 0.0);
    }
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64;
    let variance =
        pixels.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / pixels.len() as f64;
    (mean, variance.sqrt())
}

// ============================================================================
// TESTS
// ============================================================================
