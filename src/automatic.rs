//! Whole-image automatic mask generation on top of a single-point prompt decoder.
//!
//! A regular grid of foreground points is decoded one point at a time; low quality
//! and unstable hypotheses are dropped, overlapping ones are suppressed by box NMS,
//! and small islands and holes are cleaned before a second suppression pass.

use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::errors::Result;
use crate::maskops::Mask;
use crate::traits::AutoMask;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomaticConfig {
    pub points_per_side: u32,
    pub pred_iou_thresh: f64,
    pub stability_score_thresh: f64,
    pub stability_score_offset: f32,
    pub box_nms_thresh: f64,
    pub min_mask_region_area: usize,
}

impl Default for AutomaticConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            pred_iou_thresh: 0.86,
            stability_score_thresh: 0.92,
            stability_score_offset: 1.0,
            box_nms_thresh: 0.7,
            min_mask_region_area: 1000,
        }
    }
}

/// One decoder output: logits at the original image size and the predicted IoU.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub logits: Array2<f32>,
    pub predicted_iou: f64,
}

/// Cell centres of an `n` x `n` grid over the image, row by row.
pub fn grid_points(points_per_side: u32, width: u32, height: u32) -> Vec<[f32; 2]> {
    let n = points_per_side as usize;
    let step = 1.0 / points_per_side as f32;
    (0..n)
        .flat_map(|row| {
            (0..n).map(move |col| {
                [
                    (col as f32 + 0.5) * step * width as f32,
                    (row as f32 + 0.5) * step * height as f32,
                ]
            })
        })
        .collect()
}

/// IoU between the masks thresholded at `+offset` and `-offset`.
pub fn stability_score(logits: ArrayView2<f32>, offset: f32) -> f64 {
    let (mut inner, mut outer) = (0usize, 0usize);
    for &v in logits.iter() {
        if v > offset {
            inner += 1;
        }
        if v > -offset {
            outer += 1;
        }
    }
    if outer == 0 {
        0.0
    } else {
        inner as f64 / outer as f64
    }
}

fn box_area(b: &[u32; 4]) -> f64 {
    f64::from(b[2] - b[0] + 1) * f64::from(b[3] - b[1] + 1)
}

/// IoU of two inclusive `[x0, y0, x1, y1]` boxes.
pub fn box_iou(a: &[u32; 4], b: &[u32; 4]) -> f64 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    if x1 < x0 || y1 < y0 {
        return 0.0;
    }
    let intersection = f64::from(x1 - x0 + 1) * f64::from(y1 - y0 + 1);
    intersection / (box_area(a) + box_area(b) - intersection)
}

/// Greedy non-maximum suppression. Returns kept indices, best score first.
///
/// Equal scores keep their input order.
pub fn box_nms(boxes: &[[u32; 4]], scores: &[f64], threshold: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut kept: Vec<usize> = Vec::new();
    for index in order {
        if kept
            .iter()
            .all(|&k| box_iou(&boxes[k], &boxes[index]) <= threshold)
        {
            kept.push(index);
        }
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Holes,
    Islands,
}

/// Removes foreground islands (or fills background holes) smaller than `area_threshold`.
///
/// When every island is small, the largest one is kept. The flag reports whether
/// anything changed.
pub fn remove_small_regions(mask: &Mask, area_threshold: usize, kind: RegionKind) -> (Mask, bool) {
    let (width, height) = mask.dimensions();
    if width * height <= 1 {
        return (mask.clone(), false);
    }
    // Holes are the foreground of the inverted mask.
    let working = match kind {
        RegionKind::Holes => mask.invert(),
        RegionKind::Islands => mask.clone(),
    };
    let labels = connected_components(working.as_image(), Connectivity::Eight, Luma([0u8]));
    let label_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;

    let mut sizes = vec![0usize; label_count + 1];
    for Luma([label]) in labels.pixels() {
        sizes[*label as usize] += 1;
    }
    let small: Vec<bool> = sizes
        .iter()
        .enumerate()
        .map(|(label, &size)| label != 0 && size < area_threshold)
        .collect();
    if !small.iter().any(|&s| s) {
        return (mask.clone(), false);
    }

    let cleaned = match kind {
        RegionKind::Holes => Mask::from_fn(width, height, |x, y| {
            let label = labels.get_pixel(x, y)[0] as usize;
            label == 0 || small[label]
        }),
        RegionKind::Islands => {
            let any_large = (1..=label_count).any(|label| !small[label]);
            let largest = (1..=label_count)
                .fold((0, 0), |best, label| {
                    if sizes[label] > best.1 {
                        (label, sizes[label])
                    } else {
                        best
                    }
                })
                .0;
            Mask::from_fn(width, height, |x, y| {
                let label = labels.get_pixel(x, y)[0] as usize;
                if any_large {
                    label != 0 && !small[label]
                } else {
                    label == largest
                }
            })
        }
    };
    (cleaned, true)
}

struct Proposal {
    mask: Mask,
    bbox: [u32; 4],
    predicted_iou: f64,
    stability_score: f64,
}

/// Runs the generator over an image of the given size.
///
/// `decode` returns the multimask hypotheses for a single foreground point.
pub fn generate<F>(
    (width, height): (u32, u32),
    config: &AutomaticConfig,
    mut decode: F,
) -> Result<Vec<AutoMask>>
where
    F: FnMut([f32; 2]) -> Result<Vec<Hypothesis>>,
{
    let mut proposals = Vec::new();
    let points = grid_points(config.points_per_side, width, height);
    let mut decoded = 0usize;

    for point in points {
        for hypothesis in decode(point)? {
            decoded += 1;
            if hypothesis.predicted_iou <= config.pred_iou_thresh {
                continue;
            }
            let stability = stability_score(hypothesis.logits.view(), config.stability_score_offset);
            if stability < config.stability_score_thresh {
                continue;
            }
            let mask = Mask::from_logits(hypothesis.logits.view(), 0.0);
            let Some(bbox) = mask.bounding_box() else {
                continue;
            };
            proposals.push(Proposal {
                mask,
                bbox,
                predicted_iou: hypothesis.predicted_iou,
                stability_score: stability,
            });
        }
    }

    let proposals = suppress(proposals, config.box_nms_thresh, |p| p.predicted_iou);
    let proposals = if config.min_mask_region_area > 0 {
        postprocess_small_regions(proposals, config)
    } else {
        proposals
    };

    debug!(decoded, kept = proposals.len(), "automatic mask generation finished");
    Ok(proposals
        .into_iter()
        .map(|p| AutoMask {
            mask: p.mask,
            predicted_iou: p.predicted_iou,
            stability_score: p.stability_score,
        })
        .collect())
}

fn suppress<F>(proposals: Vec<Proposal>, threshold: f64, score: F) -> Vec<Proposal>
where
    F: Fn(&Proposal) -> f64,
{
    let boxes: Vec<_> = proposals.iter().map(|p| p.bbox).collect();
    let scores: Vec<_> = proposals.iter().map(score).collect();
    let kept = box_nms(&boxes, &scores, threshold);

    let mut slots: Vec<Option<Proposal>> = proposals.into_iter().map(Some).collect();
    kept.into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}

/// Cleans every proposal, then suppresses again preferring masks that did not change.
fn postprocess_small_regions(proposals: Vec<Proposal>, config: &AutomaticConfig) -> Vec<Proposal> {
    let mut cleaned = Vec::with_capacity(proposals.len());
    let mut unchanged = Vec::with_capacity(proposals.len());
    for proposal in proposals {
        let (mask, holes_changed) =
            remove_small_regions(&proposal.mask, config.min_mask_region_area, RegionKind::Holes);
        let (mask, islands_changed) =
            remove_small_regions(&mask, config.min_mask_region_area, RegionKind::Islands);
        let Some(bbox) = mask.bounding_box() else {
            continue;
        };
        unchanged.push(!(holes_changed || islands_changed));
        cleaned.push(Proposal {
            mask,
            bbox,
            ..proposal
        });
    }

    let scores: Vec<f64> = unchanged.iter().map(|&u| f64::from(u8::from(u))).collect();
    let boxes: Vec<_> = cleaned.iter().map(|p| p.bbox).collect();
    let kept = box_nms(&boxes, &scores, config.box_nms_thresh);
    let mut slots: Vec<Option<Proposal>> = cleaned.into_iter().map(Some).collect();
    kept.into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}
