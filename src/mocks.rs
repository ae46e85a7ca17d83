use crate::errors::{Result, SpriteCutoutError};
use crate::maskops::Mask;
use crate::prompts::PromptSet;
use crate::traits::{AutoMask, ScoredMask, SegmentationOracle};
use image::RgbImage;
use parking_lot::Mutex;

type Responder = Box<dyn Fn(&PromptSet) -> Vec<ScoredMask> + Send + Sync>;

/// テスト用のフィクスチャオラクル
///
/// 固定のマスクを返し、受け取ったプロンプトをすべて記録する。
pub struct FixtureOracle {
    respond: Responder,
    auto_masks: Vec<AutoMask>,
    prepared: Mutex<Option<(u32, u32)>>,
    prompts: Mutex<Vec<PromptSet>>,
    automatic_calls: Mutex<usize>,
}

impl FixtureOracle {
    /// Every prompted query returns `point_masks`; automatic generation returns `auto_masks`.
    pub fn new(point_masks: Vec<ScoredMask>, auto_masks: Vec<AutoMask>) -> Self {
        Self::with_responder(move |_| point_masks.clone(), auto_masks)
    }

    /// Prompted queries are answered by `respond`.
    pub fn with_responder<F>(respond: F, auto_masks: Vec<AutoMask>) -> Self
    where
        F: Fn(&PromptSet) -> Vec<ScoredMask> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            auto_masks,
            prepared: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            automatic_calls: Mutex::new(0),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<PromptSet> {
        self.prompts.lock().clone()
    }

    pub fn automatic_calls(&self) -> usize {
        *self.automatic_calls.lock()
    }

    /// Dimensions of the last image passed to `set_image`.
    pub fn prepared_image(&self) -> Option<(u32, u32)> {
        *self.prepared.lock()
    }
}

impl SegmentationOracle for FixtureOracle {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        *self.prepared.lock() = Some(image.dimensions());
        Ok(())
    }

    fn predict(&self, prompt: &PromptSet, _multimask: bool) -> Result<Vec<ScoredMask>> {
        let dimensions = self.prepared_image().ok_or_else(|| {
            SpriteCutoutError::model("フィクスチャ推論", "set_image has not been called")
        })?;
        self.prompts.lock().push(prompt.clone());
        let masks = (self.respond)(prompt);
        if let Some(wrong) = masks.iter().find(|m| m.mask.dimensions() != dimensions) {
            return Err(SpriteCutoutError::Validation {
                field: "fixture mask".to_string(),
                reason: format!(
                    "is {:?} but the prepared image is {:?}",
                    wrong.mask.dimensions(),
                    dimensions
                ),
            });
        }
        Ok(masks)
    }

    fn generate_automatic(&self, _image: &RgbImage) -> Result<Vec<AutoMask>> {
        *self.automatic_calls.lock() += 1;
        Ok(self.auto_masks.clone())
    }
}

/// A `width` x `height` mask with a filled `w` x `h` rectangle at `(x, y)`.
pub fn rect_mask(width: u32, height: u32, x: u32, y: u32, w: u32, h: u32) -> Mask {
    Mask::from_fn(width, height, |px, py| {
        (x..x + w).contains(&px) && (y..y + h).contains(&py)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_requires_image() {
        let oracle = FixtureOracle::new(Vec::new(), Vec::new());
        assert!(oracle.predict(&PromptSet::default(), true).is_err());
    }

    #[test]
    fn test_records_prompts() -> Result<()> {
        let mask = rect_mask(10, 10, 2, 2, 4, 4);
        let oracle = FixtureOracle::new(
            vec![ScoredMask {
                mask: mask.clone(),
                confidence: 0.5,
            }],
            vec![AutoMask::new(mask)],
        );
        oracle.set_image(&RgbImage::new(10, 10))?;
        let masks = oracle.predict(&PromptSet::default(), true)?;
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].mask.count(), 16);
        assert_eq!(oracle.prompts().len(), 1);
        assert_eq!(oracle.generate_automatic(&RgbImage::new(10, 10))?.len(), 1);
        assert_eq!(oracle.automatic_calls(), 1);
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_fixture() -> Result<()> {
        let oracle = FixtureOracle::new(
            vec![ScoredMask {
                mask: Mask::new(5, 5),
                confidence: 0.5,
            }],
            Vec::new(),
        );
        oracle.set_image(&RgbImage::new(10, 10))?;
        assert!(oracle.predict(&PromptSet::default(), true).is_err());
        Ok(())
    }
}
