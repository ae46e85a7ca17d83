use std::fmt;
use std::str::FromStr;

use crate::errors::SpriteCutoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointLabel {
    Background,
    Foreground,
}

impl PointLabel {
    /// `1` for foreground, `0` for background.
    pub const fn value(self) -> i32 {
        match self {
            Self::Background => 0,
            Self::Foreground => 1,
        }
    }
}

/// Axis-aligned box prompt in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxPrompt {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// Point prompts (foreground first) with a parallel label list, plus an optional box.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PromptSet {
    pub points: Vec<[f32; 2]>,
    pub labels: Vec<PointLabel>,
    pub bbox: Option<BoxPrompt>,
}

impl PromptSet {
    pub fn foreground_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&l| l == PointLabel::Foreground)
            .count()
    }

    pub fn with_box(mut self, bbox: BoxPrompt) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// A user supplied `x,y` point, interpreted against each image's size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSpec {
    pub x: f64,
    pub y: f64,
}

impl PointSpec {
    /// Both coordinates in `[0, 1]` means normalized and scaled to `(width - 1, height - 1)`;
    /// anything else is taken as pixels. The result is clamped to the image.
    pub fn resolve(&self, width: u32, height: u32) -> [f32; 2] {
        let max_x = f64::from(width.saturating_sub(1));
        let max_y = f64::from(height.saturating_sub(1));
        let (mut x, mut y) = (self.x, self.y);
        if (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y) {
            x *= max_x;
            y *= max_y;
        }
        [x.clamp(0.0, max_x) as f32, y.clamp(0.0, max_y) as f32]
    }
}

impl FromStr for PointSpec {
    type Err = SpriteCutoutError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || SpriteCutoutError::Validation {
            field: format!("point '{raw}'"),
            reason: "is invalid. Expected format x,y".to_string(),
        };
        let (xs, ys) = raw.split_once(',').ok_or_else(invalid)?;
        let x: f64 = xs.trim().parse().map_err(|_| invalid())?;
        let y: f64 = ys.trim().parse().map_err(|_| invalid())?;
        // Infinities are clamped to the image edge on resolve.
        if x.is_nan() || y.is_nan() {
            return Err(invalid());
        }
        Ok(Self { x, y })
    }
}

impl fmt::Display for PointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// User points resolved to pixel coordinates for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPoints {
    pub foreground: Vec<[f32; 2]>,
    pub background: Vec<[f32; 2]>,
}

impl UserPoints {
    pub fn resolve(foreground: &[PointSpec], background: &[PointSpec], width: u32, height: u32) -> Self {
        Self {
            foreground: foreground.iter().map(|p| p.resolve(width, height)).collect(),
            background: background.iter().map(|p| p.resolve(width, height)).collect(),
        }
    }
}

fn frac(size: u32, fraction: f64) -> f32 {
    (f64::from(size) * fraction) as u32 as f32
}

/// Deterministic point layout for a `width` x `height` image.
///
/// Five positives around the centre, six more lower in the frame when `expanded`,
/// twelve negatives on the corners, edge midpoints and 10%/90% insets, then the user
/// points appended to their respective sides.
pub fn plan_points(width: u32, height: u32, expanded: bool, extra: &UserPoints) -> PromptSet {
    let (w, h) = (width, height);
    let mut positive = vec![
        [(w / 2) as f32, (h / 2) as f32],
        [frac(w, 0.50), frac(h, 0.42)],
        [frac(w, 0.50), frac(h, 0.58)],
        [frac(w, 0.42), frac(h, 0.50)],
        [frac(w, 0.58), frac(h, 0.50)],
    ];
    if expanded {
        positive.extend([
            [frac(w, 0.50), frac(h, 0.68)],
            [frac(w, 0.50), frac(h, 0.80)],
            [frac(w, 0.38), frac(h, 0.68)],
            [frac(w, 0.62), frac(h, 0.68)],
            [frac(w, 0.30), frac(h, 0.80)],
            [frac(w, 0.70), frac(h, 0.80)],
        ]);
    }

    let right = w.saturating_sub(1) as f32;
    let bottom = h.saturating_sub(1) as f32;
    let mut negative = vec![
        [0.0, 0.0],
        [right, 0.0],
        [0.0, bottom],
        [right, bottom],
        [(w / 2) as f32, 0.0],
        [(w / 2) as f32, bottom],
        [0.0, (h / 2) as f32],
        [right, (h / 2) as f32],
        [frac(w, 0.10), frac(h, 0.10)],
        [frac(w, 0.90), frac(h, 0.10)],
        [frac(w, 0.10), frac(h, 0.90)],
        [frac(w, 0.90), frac(h, 0.90)],
    ];
    positive.extend_from_slice(&extra.foreground);
    negative.extend_from_slice(&extra.background);

    let labels = std::iter::repeat(PointLabel::Foreground)
        .take(positive.len())
        .chain(std::iter::repeat(PointLabel::Background).take(negative.len()))
        .collect();
    positive.extend(negative);

    PromptSet {
        points: positive,
        labels,
        bbox: None,
    }
}

/// Box covering 3%..97% of each dimension.
pub fn central_box(width: u32, height: u32) -> BoxPrompt {
    BoxPrompt {
        x0: frac(width, 0.03),
        y0: frac(height, 0.03),
        x1: frac(width, 0.97),
        y1: frac(height, 0.97),
    }
}
