use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::mask::Mask;

/// A component survives when it is at least this fraction of the largest one.
const MIN_RELATIVE_AREA: f64 = 0.12;
/// ...and no more than this fraction of its pixels lie on the image border.
const MAX_BORDER_SHARE: f64 = 0.25;

#[derive(Debug, Clone, Copy, Default)]
struct ComponentStats {
    area: usize,
    border_hits: usize,
}

/// Reduces a mask to its dominant 8-connected components.
///
/// Falls back to the single largest component when nothing qualifies, so the
/// result is never empty if the input had any foreground.
pub fn keep_main_components(mask: &Mask) -> Mask {
    let (width, height) = mask.dimensions();
    // connected_components panics on a single-pixel image.
    if width * height <= 1 {
        return mask.clone();
    }
    let labels = connected_components(mask.as_image(), Connectivity::Eight, Luma([0u8]));

    let label_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if label_count == 0 {
        return mask.clone();
    }

    let mut stats = vec![ComponentStats::default(); label_count + 1];
    for (x, y, Luma([label])) in labels.enumerate_pixels() {
        if *label == 0 {
            continue;
        }
        let entry = &mut stats[*label as usize];
        entry.area += 1;
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            entry.border_hits += 1;
        }
    }

    // First label wins ties.
    let (largest_label, largest_area) = stats
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, 0), |best, (label, s)| {
            if s.area > best.1 {
                (label, s.area)
            } else {
                best
            }
        });

    let kept: Vec<bool> = stats
        .iter()
        .enumerate()
        .map(|(label, s)| {
            label != 0
                && s.area as f64 >= largest_area as f64 * MIN_RELATIVE_AREA
                && s.border_hits as f64 <= s.area as f64 * MAX_BORDER_SHARE
        })
        .collect();

    if !kept.iter().any(|&k| k) {
        tracing::debug!(
            largest_area,
            "no component qualified, keeping the largest"
        );
        return Mask::from_fn(width, height, |x, y| {
            labels.get_pixel(x, y)[0] as usize == largest_label
        });
    }

    Mask::from_fn(width, height, |x, y| kept[labels.get_pixel(x, y)[0] as usize])
}
