use image::{imageops, GrayImage, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, erode};

use super::graphcut::{grab_cut, SeedLabel, SeedMap};
use super::mask::Mask;

/// Below this foreground fraction the mask is returned untouched.
const MIN_REFINE_AREA: f64 = 0.01;
const EDGE_BLUR_SIGMA: f32 = 1.1;
const CANNY_LOW: f32 = 35.0;
const CANNY_HIGH: f32 = 110.0;
const GRAPH_CUT_ITERATIONS: usize = 3;
/// Accepted range of refined area relative to the input area.
const MIN_AREA_RATIO: f64 = 0.55;
const MAX_AREA_RATIO: f64 = 1.85;

/// Graph-cut boundary refinement seeded from `mask` and the detected image edges.
///
/// Returns the input unchanged when the mask is nearly empty, when the solver fails,
/// or when the refinement shrinks or grows the subject too much.
pub fn edge_guided_refine(image: &RgbImage, mask: &Mask) -> Mask {
    if mask.area_fraction() < MIN_REFINE_AREA {
        return mask.clone();
    }

    let mut seeds = build_seed_map(image, mask);
    tracing::debug!(
        sure_fg = seeds.count(SeedLabel::Foreground),
        sure_bg = seeds.count(SeedLabel::Background),
        "graph cut seeds"
    );

    if let Err(e) = grab_cut(image, &mut seeds, GRAPH_CUT_ITERATIONS) {
        tracing::debug!("edge refinement skipped: {e}");
        return mask.clone();
    }

    accept_refinement(mask, seeds.foreground_mask())
}

/// Rollback guard: keeps `refined` only if its area stays within
/// `[0.55, 1.85]` times the area of `original`.
pub fn accept_refinement(original: &Mask, refined: Mask) -> Mask {
    let source_area = original.area_fraction();
    let refined_area = refined.area_fraction();
    if refined_area < source_area * MIN_AREA_RATIO || refined_area > source_area * MAX_AREA_RATIO {
        tracing::debug!(
            source_area,
            refined_area,
            "edge refinement rolled back"
        );
        return original.clone();
    }
    refined
}

/// Blurred-grayscale Canny edges, dilated once with a 3x3 square.
pub fn edge_band(image: &RgbImage) -> GrayImage {
    let gray = imageops::grayscale(image);
    let blurred = gaussian_blur_f32(&gray, EDGE_BLUR_SIGMA);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    dilate(&edges, Norm::LInf, 1)
}

/// Four-level graph-cut initialisation derived from a binary mask.
///
/// Labels are applied in order, later ones overriding earlier ones:
/// probable background everywhere, probable foreground on the dilated mask,
/// background on the image margin and far outside the mask, foreground on the
/// eroded mask, and finally probable foreground wherever an edge crosses the
/// dilated mask so the cut can settle on it.
pub fn build_seed_map(image: &RgbImage, mask: &Mask) -> SeedMap {
    let (width, height) = mask.dimensions();
    // 3x3 twice is a Chebyshev radius of 2, 5x5 twice a radius of 4.
    let binary = mask.to_alpha();
    let sure_fg = erode(&binary, Norm::LInf, 2);
    let probable_fg = dilate(&binary, Norm::LInf, 4);
    let outside = Mask::from_nonzero(&probable_fg).invert().to_alpha();
    let far_outside = erode(&outside, Norm::LInf, 2);
    let edges = edge_band(image);

    let margin = border_margin(width, height);
    let in_margin = |x: u32, y: u32| {
        x < margin || y < margin || x + margin >= width || y + margin >= height
    };

    let mut seeds = SeedMap::filled(width, height, SeedLabel::ProbableBackground);
    for y in 0..height {
        for x in 0..width {
            let probable = probable_fg.get_pixel(x, y)[0] != 0;
            let mut label = SeedLabel::ProbableBackground;
            if probable {
                label = SeedLabel::ProbableForeground;
            }
            if in_margin(x, y) || far_outside.get_pixel(x, y)[0] != 0 {
                label = SeedLabel::Background;
            }
            if sure_fg.get_pixel(x, y)[0] != 0 {
                label = SeedLabel::Foreground;
            }
            if probable && edges.get_pixel(x, y)[0] != 0 {
                label = SeedLabel::ProbableForeground;
            }
            seeds.set(x, y, label);
        }
    }
    seeds
}

/// `max(8, 3% of the shorter side)`.
pub fn border_margin(width: u32, height: u32) -> u32 {
    let shorter = width.min(height) as f64;
    ((0.03 * shorter) as u32).max(8)
}
