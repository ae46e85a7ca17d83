use image::{GrayImage, Luma};
use ndarray::ArrayView2;

/// Binary foreground mask with the same dimensions as its source image.
///
/// Every pixel holds either `0` or `1`. Constructors normalize whatever they are
/// given (any non-zero value is foreground), so no mask can leave this module in a
/// non-binary state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    pixels: GrayImage,
}

impl Mask {
    /// All-background mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: GrayImage::new(width, height),
        }
    }

    pub fn from_fn<F>(width: u32, height: u32, mut foreground: F) -> Self
    where
        F: FnMut(u32, u32) -> bool,
    {
        Self {
            pixels: GrayImage::from_fn(width, height, |x, y| Luma([u8::from(foreground(x, y))])),
        }
    }

    /// Treats every non-zero pixel as foreground.
    pub fn from_nonzero(image: &GrayImage) -> Self {
        let mut pixels = image.clone();
        for Luma([v]) in pixels.pixels_mut() {
            *v = u8::from(*v > 0);
        }
        Self { pixels }
    }

    /// Binarizes a `(height, width)` logit map at `threshold` (strictly greater is foreground).
    pub fn from_logits(logits: ArrayView2<f32>, threshold: f32) -> Self {
        let (height, width) = logits.dim();
        Self::from_fn(width as u32, height as u32, |x, y| {
            logits[[y as usize, x as usize]] > threshold
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.pixels.get_pixel(x, y)[0] != 0
    }

    pub fn set(&mut self, x: u32, y: u32, foreground: bool) {
        self.pixels.put_pixel(x, y, Luma([u8::from(foreground)]));
    }

    /// Number of foreground pixels.
    pub fn count(&self) -> usize {
        self.pixels.as_raw().iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.as_raw().iter().all(|&v| v == 0)
    }

    /// The underlying 0/1 image, for imageproc operations that treat non-zero as foreground.
    pub fn as_image(&self) -> &GrayImage {
        &self.pixels
    }

    /// 8-bit opacity: 0 or 255.
    pub fn to_alpha(&self) -> GrayImage {
        let mut alpha = self.pixels.clone();
        for Luma([v]) in alpha.pixels_mut() {
            *v = if *v != 0 { u8::MAX } else { 0 };
        }
        alpha
    }

    pub fn invert(&self) -> Self {
        Self::from_fn(self.width(), self.height(), |x, y| !self.get(x, y))
    }

    /// Fraction of foreground pixels, in `[0, 1]`.
    pub fn area_fraction(&self) -> f64 {
        let total = self.pixels.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        self.count() as f64 / total as f64
    }

    /// Mean foreground value over the top row, bottom row, left column and right column.
    ///
    /// Corners belong to two lines and are counted once per line.
    pub fn border_touch(&self) -> f64 {
        border_fraction(&self.pixels, |v| v != 0)
    }

    /// Whether the pixel at `(width / 2, height / 2)` is foreground.
    pub fn center_on(&self) -> bool {
        let (width, height) = self.dimensions();
        width > 0 && height > 0 && self.get(width / 2, height / 2)
    }

    /// Inclusive `[x0, y0, x1, y1]` bounds of the foreground.
    pub fn bounding_box(&self) -> Option<[u32; 4]> {
        let (width, height) = self.dimensions();
        let mut bounds = [width, height, 0, 0];
        let mut found = false;
        for (x, y, Luma([v])) in self.pixels.enumerate_pixels() {
            if *v != 0 {
                found = true;
                bounds[0] = bounds[0].min(x);
                bounds[1] = bounds[1].min(y);
                bounds[2] = bounds[2].max(x);
                bounds[3] = bounds[3].max(y);
            }
        }
        found.then_some(bounds)
    }
}

/// Fraction of border-line pixels satisfying `is_set`, with corners counted once per line.
pub fn border_fraction<F>(image: &GrayImage, is_set: F) -> f64
where
    F: Fn(u8) -> bool,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let at = |x: u32, y: u32| usize::from(is_set(image.get_pixel(x, y)[0]));
    let horizontal: usize = (0..width).map(|x| at(x, 0) + at(x, height - 1)).sum();
    let vertical: usize = (0..height).map(|y| at(0, y) + at(width - 1, y)).sum();
    let total = 2 * (width as usize + height as usize);
    (horizontal + vertical) as f64 / total as f64
}
