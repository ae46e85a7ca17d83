use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;

use crate::automatic::AutomaticConfig;
use crate::candidates::SelectionSettings;
use crate::errors::{Result, SpriteCutoutError};
use crate::prompts::PointSpec;

/// Output formats that can carry an alpha channel.
const ALPHA_FORMATS: [ImageFormat; 8] = [
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Tiff,
    ImageFormat::Bmp,
    ImageFormat::Gif,
    ImageFormat::Avif,
    ImageFormat::Tga,
    ImageFormat::Qoi,
];

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Segment Anything image encoder (ONNX)
    #[arg(short, long)]
    pub encoder: PathBuf,

    /// Segment Anything prompt decoder (ONNX)
    #[arg(short = 'm', long)]
    pub decoder: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value_t = default_threads())]
    pub num_threads: usize,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    /// Cutoff used only for the reported area and border metrics
    #[arg(long, default_value_t = 10)]
    pub alpha_threshold: u8,

    /// Gaussian sigma for the alpha edge; 0 keeps it hard
    #[arg(long, default_value_t = 1.1, allow_negative_numbers = true)]
    pub feather_sigma: f32,

    /// Preferred foreground fraction
    #[arg(long, default_value_t = 0.30)]
    pub target_area: f64,

    #[arg(long, default_value_t = 0.15)]
    pub min_area: f64,

    #[arg(long, default_value_t = 0.90)]
    pub max_area: f64,

    /// Extra foreground point, `x,y` in pixels or normalized to [0, 1]
    #[arg(long = "fg-point", allow_hyphen_values = true)]
    pub fg_points: Vec<PointSpec>,

    /// Extra background point, `x,y` in pixels or normalized to [0, 1]
    #[arg(long = "bg-point", allow_hyphen_values = true)]
    pub bg_points: Vec<PointSpec>,

    #[arg(long)]
    pub no_edge_refine: bool,

    #[arg(long, default_value_t = 32)]
    pub points_per_side: u32,

    #[arg(long, default_value_t = 0.86)]
    pub pred_iou_thresh: f64,

    #[arg(long, default_value_t = 0.92)]
    pub stability_score_thresh: f64,

    #[arg(long, default_value_t = 1000)]
    pub min_mask_region_area: usize,

    /// Copy every output over the same-named file in this directory
    #[arg(long)]
    pub replace_dir: Option<PathBuf>,

    #[arg(long, default_value = "backup_pre_sam")]
    pub backup_dir: PathBuf,

    #[arg(long)]
    pub debug: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    /// 値の範囲と相互関係を検証
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("target_area", self.target_area),
            ("min_area", self.min_area),
            ("max_area", self.max_area),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SpriteCutoutError::Validation {
                    field: field.to_string(),
                    reason: format!("must be within [0, 1], got {value}"),
                });
            }
        }
        if self.min_area > self.max_area {
            return Err(SpriteCutoutError::Validation {
                field: "min_area".to_string(),
                reason: format!("{} exceeds max_area {}", self.min_area, self.max_area),
            });
        }
        if !(self.feather_sigma >= 0.0 && self.feather_sigma.is_finite()) {
            return Err(SpriteCutoutError::Validation {
                field: "feather_sigma".to_string(),
                reason: format!("must be a finite value >= 0, got {}", self.feather_sigma),
            });
        }
        if self.points_per_side == 0 {
            return Err(SpriteCutoutError::Validation {
                field: "points_per_side".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.num_threads == 0 {
            return Err(SpriteCutoutError::Validation {
                field: "num_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn selection_settings(&self) -> SelectionSettings {
        SelectionSettings {
            target_area: self.target_area,
            min_area: self.min_area,
            max_area: self.max_area,
        }
    }

    pub fn automatic_config(&self) -> AutomaticConfig {
        AutomaticConfig {
            points_per_side: self.points_per_side,
            pred_iou_thresh: self.pred_iou_thresh,
            stability_score_thresh: self.stability_score_thresh,
            min_mask_region_area: self.min_mask_region_area,
            ..AutomaticConfig::default()
        }
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ALPHA_FORMATS
        .iter()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() || !ALPHA_FORMATS.contains(&format) {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
