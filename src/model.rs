use std::path::Path;

use crate::{
    automatic::{self, AutomaticConfig, Hypothesis},
    errors::{Result, SpriteCutoutError},
    maskops::{padding::pad_bottom_right, Mask},
    prompts::PromptSet,
    traits::{AutoMask, ScoredMask, SegmentationOracle},
};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use imageproc::map::map_colors;
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, debug_span};

/// Side length of the square encoder input.
pub const ENCODER_SIZE: u32 = 1024;
const LOW_RES_MASK_SIZE: usize = 256;
const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Label of a padding point, ignored by the decoder.
const PAD_LABEL: f32 = -1.0;
const BOX_TOP_LEFT_LABEL: f32 = 2.0;
const BOX_BOTTOM_RIGHT_LABEL: f32 = 3.0;

struct Embedding {
    source: RgbImage,
    features: Array4<f32>,
}

/// Segment Anything split into an image encoder and a prompt decoder, both ONNX.
pub struct SamOnnx {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    embedding: Mutex<Option<Embedding>>,
    automatic: AutomaticConfig,
}

fn build_session(model_path: &Path, device_id: i32, num_threads: usize) -> Result<Session> {
    let session = SessionBuilder::new()
        .map_err(|e| SpriteCutoutError::Model {
            operation: "セッションビルダー初期化".to_string(),
            source: Box::new(e),
        })?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])
        .map_err(|e| SpriteCutoutError::Model {
            operation: "実行プロバイダー設定".to_string(),
            source: Box::new(e),
        })?
        .with_intra_threads(num_threads)
        .map_err(|e| SpriteCutoutError::Model {
            operation: "スレッド数設定".to_string(),
            source: Box::new(e),
        })?
        .with_memory_pattern(true)
        .map_err(|e| SpriteCutoutError::Model {
            operation: "メモリパターン設定".to_string(),
            source: Box::new(e),
        })?
        .commit_from_file(model_path)
        .map_err(|e| SpriteCutoutError::Model {
            operation: format!("モデルファイル読み込み: {}", model_path.display()),
            source: Box::new(e),
        })?;
    Ok(session)
}

/// Size of the image after resizing its longest side to `ENCODER_SIZE`, as `(width, height)`.
pub fn resized_dimensions(width: u32, height: u32) -> (u32, u32) {
    let scale = f64::from(ENCODER_SIZE) / f64::from(width.max(height));
    let w = (f64::from(width) * scale + 0.5) as u32;
    let h = (f64::from(height) * scale + 0.5) as u32;
    (w.clamp(1, ENCODER_SIZE), h.clamp(1, ENCODER_SIZE))
}

/// Maps pixel coordinates of the original image into encoder input coordinates.
pub fn scale_point([x, y]: [f32; 2], width: u32, height: u32) -> [f32; 2] {
    let (w, h) = resized_dimensions(width, height);
    [
        x * w as f32 / width as f32,
        y * h as f32 / height as f32,
    ]
}

/// Resize, normalize and zero pad an image into a `[1, 3, 1024, 1024]` tensor.
pub fn preprocess(image: &RgbImage) -> Result<Array4<f32>> {
    let (width, height) = image.dimensions();
    let (w, h) = resized_dimensions(width, height);
    let resized = imageops::resize(image, w, h, FilterType::Triangle);
    let normalized = map_colors(&resized, |Rgb(channels)| {
        Rgb([
            (f32::from(channels[0]) - PIXEL_MEAN[0]) / PIXEL_STD[0],
            (f32::from(channels[1]) - PIXEL_MEAN[1]) / PIXEL_STD[1],
            (f32::from(channels[2]) - PIXEL_MEAN[2]) / PIXEL_STD[2],
        ])
    });
    let padded = pad_bottom_right(&normalized, ENCODER_SIZE, ENCODER_SIZE, Rgb([0.0f32; 3]))
        .ok_or_else(|| SpriteCutoutError::ImageProcessing {
            path: "unknown".to_string(),
            operation: "パディング追加".to_string(),
            source: format!("{w}x{h} does not fit the encoder input").into(),
        })?;

    Ok(padded
        .as_ndarray3()
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned())
}

/// Point coordinates and labels in the decoder's layout.
///
/// A box becomes two corner points labelled 2 and 3; without a box a padding point
/// is appended.
pub fn encode_prompt(prompt: &PromptSet, width: u32, height: u32) -> (Array3<f32>, Array2<f32>) {
    let mut coords: Vec<[f32; 2]> = prompt
        .points
        .iter()
        .map(|&p| scale_point(p, width, height))
        .collect();
    let mut labels: Vec<f32> = prompt.labels.iter().map(|l| l.value() as f32).collect();

    match prompt.bbox {
        Some(bbox) => {
            coords.push(scale_point([bbox.x0, bbox.y0], width, height));
            coords.push(scale_point([bbox.x1, bbox.y1], width, height));
            labels.extend([BOX_TOP_LEFT_LABEL, BOX_BOTTOM_RIGHT_LABEL]);
        }
        None => {
            coords.push([0.0, 0.0]);
            labels.push(PAD_LABEL);
        }
    }

    let n = coords.len();
    let coords = Array3::from_shape_fn((1, n, 2), |(_, i, j)| coords[i][j]);
    let labels = Array2::from_shape_fn((1, n), |(_, i)| labels[i]);
    (coords, labels)
}

/// Mask token indices to keep from a decoder output with `tokens` masks.
pub fn token_range(tokens: usize, multimask: bool) -> std::ops::Range<usize> {
    match (tokens, multimask) {
        (0 | 1, _) => 0..tokens,
        (_, true) => 1..tokens,
        (_, false) => 0..1,
    }
}

impl SamOnnx {
    pub fn new(
        encoder_path: &Path,
        decoder_path: &Path,
        device_id: i32,
        num_threads: usize,
        automatic: AutomaticConfig,
    ) -> Result<Self> {
        let encoder = build_session(encoder_path, device_id, num_threads)?;
        let decoder = build_session(decoder_path, device_id, num_threads)?;
        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            embedding: Mutex::new(None),
            automatic,
        })
    }

    fn encode(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let _span = debug_span!("encode", width = image.width(), height = image.height()).entered();
        let tensor = preprocess(image)?;
        let mut session = self.encoder.lock();
        let outputs = session.run(ort::inputs!["image" => TensorRef::from_array_view(&tensor)?])?;
        Ok(outputs["image_embeddings"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    fn decode(
        &self,
        features: &Array4<f32>,
        coords: &Array3<f32>,
        labels: &Array2<f32>,
        (width, height): (u32, u32),
        multimask: bool,
    ) -> Result<Vec<Hypothesis>> {
        let mask_input = Array4::<f32>::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);
        let orig_im_size = arr1(&[height as f32, width as f32]);

        let mut session = self.decoder.lock();
        let outputs = session.run(ort::inputs![
            "image_embeddings" => TensorRef::from_array_view(features)?,
            "point_coords" => TensorRef::from_array_view(coords)?,
            "point_labels" => TensorRef::from_array_view(labels)?,
            "mask_input" => TensorRef::from_array_view(&mask_input)?,
            "has_mask_input" => TensorRef::from_array_view(&has_mask_input)?,
            "orig_im_size" => TensorRef::from_array_view(&orig_im_size)?
        ])?;

        let masks = outputs["masks"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?;
        let scores = outputs["iou_predictions"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix2>()?;

        let (_, tokens, rows, cols) = masks.dim();
        if (rows, cols) != (height as usize, width as usize) {
            return Err(SpriteCutoutError::model(
                "デコーダー出力確認",
                format!("masks are {cols}x{rows}, expected {width}x{height}"),
            ));
        }

        Ok(token_range(tokens, multimask)
            .map(|token| Hypothesis {
                logits: masks.slice(s![0, token, .., ..]).to_owned(),
                predicted_iou: f64::from(scores[[0, token]]),
            })
            .collect())
    }

    /// Encodes `image` unless its embedding is already cached.
    fn ensure_embedding(&self, image: &RgbImage) -> Result<()> {
        let mut cached = self.embedding.lock();
        if cached.as_ref().is_some_and(|e| e.source == *image) {
            return Ok(());
        }
        let features = self.encode(image)?;
        *cached = Some(Embedding {
            source: image.clone(),
            features,
        });
        Ok(())
    }
}

impl SegmentationOracle for SamOnnx {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        self.ensure_embedding(image)
    }

    fn predict(&self, prompt: &PromptSet, multimask: bool) -> Result<Vec<ScoredMask>> {
        let cached = self.embedding.lock();
        let embedding = cached.as_ref().ok_or_else(|| {
            SpriteCutoutError::model("プロンプト推論", "set_image must be called before predict")
        })?;
        let dimensions = embedding.source.dimensions();
        let (coords, labels) = encode_prompt(prompt, dimensions.0, dimensions.1);
        let hypotheses = self.decode(&embedding.features, &coords, &labels, dimensions, multimask)?;

        Ok(hypotheses
            .into_iter()
            .map(|h| ScoredMask {
                mask: Mask::from_logits(h.logits.view(), 0.0),
                confidence: h.predicted_iou,
            })
            .collect())
    }

    fn generate_automatic(&self, image: &RgbImage) -> Result<Vec<AutoMask>> {
        self.ensure_embedding(image)?;
        let cached = self.embedding.lock();
        let embedding = cached.as_ref().ok_or_else(|| {
            SpriteCutoutError::model("自動マスク生成", "image embedding is missing")
        })?;
        let dimensions = image.dimensions();
        debug!(
            points_per_side = self.automatic.points_per_side,
            "generating automatic masks"
        );

        automatic::generate(dimensions, &self.automatic, |point| {
            let prompt = PromptSet {
                points: vec![point],
                labels: vec![crate::prompts::PointLabel::Foreground],
                bbox: None,
            };
            let (coords, labels) = encode_prompt(&prompt, dimensions.0, dimensions.1);
            self.decode(&embedding.features, &coords, &labels, dimensions, true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{BoxPrompt, PointLabel};

    #[test]
    fn test_resized_dimensions() {
        assert_eq!(resized_dimensions(2048, 1024), (1024, 512));
        assert_eq!(resized_dimensions(100, 300), (341, 1024));
        assert_eq!(resized_dimensions(1024, 1024), (1024, 1024));
    }

    #[test]
    fn test_preprocess_shape_and_padding() -> Result<()> {
        let image = RgbImage::from_pixel(200, 100, Rgb([124, 116, 104]));
        let tensor = preprocess(&image)?;
        assert_eq!(tensor.shape(), &[1, 3, 1024, 1024]);
        // Inside the resized area the values are close to zero after normalization.
        assert!(tensor[[0, 0, 10, 10]].abs() < 0.05);
        // Padding below the 1024x512 content stays exactly zero.
        assert_eq!(tensor[[0, 1, 800, 10]], 0.0);
        let red = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
        let tensor = preprocess(&red)?;
        assert!(tensor[[0, 0, 5, 5]] > 2.0);
        assert!(tensor[[0, 2, 5, 5]] < -1.5);
        Ok(())
    }

    #[test]
    fn test_encode_prompt_without_box() {
        let prompt = PromptSet {
            points: vec![[50.0, 25.0]],
            labels: vec![PointLabel::Foreground],
            bbox: None,
        };
        let (coords, labels) = encode_prompt(&prompt, 100, 50);
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!(coords[[0, 0, 0]], 512.0);
        assert_eq!(coords[[0, 0, 1]], 256.0);
        assert_eq!(labels, arr2(&[[1.0, -1.0]]));
    }

    #[test]
    fn test_encode_prompt_with_box() {
        let prompt = PromptSet {
            points: vec![[0.0, 0.0]],
            labels: vec![PointLabel::Background],
            bbox: Some(BoxPrompt {
                x0: 10.0,
                y0: 10.0,
                x1: 90.0,
                y1: 90.0,
            }),
        };
        let (coords, labels) = encode_prompt(&prompt, 1024, 1024);
        assert_eq!(coords.shape(), &[1, 3, 2]);
        assert_eq!(coords[[0, 2, 0]], 90.0);
        assert_eq!(labels, arr2(&[[0.0, 2.0, 3.0]]));
    }

    #[test]
    fn test_token_range() {
        assert_eq!(token_range(4, true), 1..4);
        assert_eq!(token_range(4, false), 0..1);
        assert_eq!(token_range(1, true), 0..1);
    }
}
