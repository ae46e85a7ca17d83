use crate::errors::Result;
use crate::maskops::Mask;
use crate::prompts::PromptSet;
use image::RgbImage;

/// A mask returned by a prompted query, with the oracle's own confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMask {
    pub mask: Mask,
    pub confidence: f64,
}

/// A mask from whole-image automatic generation.
///
/// Quality fields default to zero when the generator does not report them.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoMask {
    pub mask: Mask,
    pub predicted_iou: f64,
    pub stability_score: f64,
}

impl AutoMask {
    pub fn new(mask: Mask) -> Self {
        Self {
            mask,
            predicted_iou: 0.0,
            stability_score: 0.0,
        }
    }
}

/// セグメンテーションオラクルの抽象化
///
/// プロンプト付き推論と自動マスク生成を提供する。状態を持つのは `set_image` で
/// 準備された画像のみで、1画像ずつ逐次的に使用される。
pub trait SegmentationOracle: Send + Sync {
    /// 以降の `predict` 呼び出しの対象となる画像を設定
    fn set_image(&self, image: &RgbImage) -> Result<()>;

    /// 点・矩形プロンプトからマスク候補を推論
    ///
    /// `multimask` が真の場合、複数の仮説を返す。
    fn predict(&self, prompt: &PromptSet, multimask: bool) -> Result<Vec<ScoredMask>>;

    /// プロンプトなしで画像全体のマスク候補を生成
    fn generate_automatic(&self, image: &RgbImage) -> Result<Vec<AutoMask>>;
}

impl<O: SegmentationOracle + ?Sized> SegmentationOracle for &O {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        (**self).set_image(image)
    }

    fn predict(&self, prompt: &PromptSet, multimask: bool) -> Result<Vec<ScoredMask>> {
        (**self).predict(prompt, multimask)
    }

    fn generate_automatic(&self, image: &RgbImage) -> Result<Vec<AutoMask>> {
        (**self).generate_automatic(image)
    }
}
