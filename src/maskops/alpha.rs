use image::{GrayImage, RgbImage, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};

use super::mask::{border_fraction, Mask};
use crate::errors::{Result, SpriteCutoutError};

/// Close then open with a 3x3 square, scale to 0/255 and feather with a Gaussian.
///
/// A `feather_sigma` of zero (or less) keeps the hard edge.
pub fn refine_alpha(mask: &Mask, feather_sigma: f32) -> GrayImage {
    // Binary morphology expects 0/255 input.
    let closed = close(&mask.to_alpha(), Norm::LInf, 1);
    let opened = Mask::from_nonzero(&open(&closed, Norm::LInf, 1));
    let alpha = opened.to_alpha();
    if feather_sigma > 0.0 {
        gaussian_blur_f32(&alpha, feather_sigma)
    } else {
        alpha
    }
}

/// Merges `alpha` into `image` as its fourth channel.
pub fn apply_alpha(image: &RgbImage, alpha: &GrayImage) -> Result<RgbaImage> {
    if image.dimensions() != alpha.dimensions() {
        return Err(SpriteCutoutError::Validation {
            field: "alpha".to_string(),
            reason: format!(
                "is {:?} but the image is {:?}",
                alpha.dimensions(),
                image.dimensions()
            ),
        });
    }

    let pixels = image
        .pixels()
        .zip(alpha.pixels())
        .flat_map(|(rgb, a)| [rgb[0], rgb[1], rgb[2], a[0]])
        .collect::<Vec<u8>>();

    RgbaImage::from_raw(image.width(), image.height(), pixels).ok_or_else(|| {
        SpriteCutoutError::Validation {
            field: "alpha".to_string(),
            reason: "could not build an RGBA buffer from the merged pixels".to_string(),
        }
    })
}

/// Foreground fraction and border-touch of an alpha channel binarized at `threshold`
/// (values strictly above it count as foreground). Only used for reporting.
pub fn alpha_metrics(alpha: &GrayImage, threshold: u8) -> (f64, f64) {
    let total = alpha.as_raw().len();
    let area = if total == 0 {
        0.0
    } else {
        alpha.as_raw().iter().filter(|&&v| v > threshold).count() as f64 / total as f64
    };
    (area, border_fraction(alpha, |v| v > threshold))
}
