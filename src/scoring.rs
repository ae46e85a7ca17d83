//! Candidate scoring.
//!
//! Both scores are linear in the oracle's own confidence and three geometric cues:
//! whether the centre pixel is covered, how much of the border is covered, and how
//! far the foreground fraction is from the preferred one. Automatic candidates get a
//! second oracle signal (stability) and a slightly weaker centring prior, since the
//! automatic generator was never told where the subject is.

use crate::maskops::Mask;

const POINT_CENTER_WEIGHT: f64 = 1.8;
const POINT_AREA_WEIGHT: f64 = 1.5;
const AUTO_STABILITY_WEIGHT: f64 = 0.7;
const AUTO_CENTER_WEIGHT: f64 = 1.6;
const AUTO_AREA_WEIGHT: f64 = 1.3;
const BORDER_WEIGHT: f64 = 2.8;

/// Geometric cues of one mask, computed once and shared by both scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskGeometry {
    pub area: f64,
    pub border_touch: f64,
    pub center_on: bool,
}

impl MaskGeometry {
    pub fn of(mask: &Mask) -> Self {
        Self {
            area: mask.area_fraction(),
            border_touch: mask.border_touch(),
            center_on: mask.center_on(),
        }
    }

    fn center(&self) -> f64 {
        if self.center_on {
            1.0
        } else {
            0.0
        }
    }
}

/// `confidence + 1.8·center − 2.8·border − 1.5·|area − target|`
pub fn score_point_geometry(geometry: &MaskGeometry, confidence: f64, target_area: f64) -> f64 {
    confidence + POINT_CENTER_WEIGHT * geometry.center()
        - BORDER_WEIGHT * geometry.border_touch
        - POINT_AREA_WEIGHT * (geometry.area - target_area).abs()
}

/// `iou + 0.7·stability + 1.6·center − 2.8·border − 1.3·|area − target|`
pub fn score_auto_geometry(
    geometry: &MaskGeometry,
    predicted_iou: f64,
    stability: f64,
    target_area: f64,
) -> f64 {
    predicted_iou + AUTO_STABILITY_WEIGHT * stability + AUTO_CENTER_WEIGHT * geometry.center()
        - BORDER_WEIGHT * geometry.border_touch
        - AUTO_AREA_WEIGHT * (geometry.area - target_area).abs()
}

/// Score of a prompt-seeded mask.
pub fn score_point(mask: &Mask, confidence: f64, target_area: f64) -> f64 {
    score_point_geometry(&MaskGeometry::of(mask), confidence, target_area)
}

/// Score of an automatically generated mask.
pub fn score_auto(mask: &Mask, predicted_iou: f64, stability: f64, target_area: f64) -> f64 {
    score_auto_geometry(&MaskGeometry::of(mask), predicted_iou, stability, target_area)
}
