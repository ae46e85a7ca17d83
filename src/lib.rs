pub mod automatic;
pub mod candidates;
pub mod config;
pub mod errors;
pub mod maskops;
pub mod model;
pub mod prompts;
pub mod replace;
pub mod scoring;
pub mod traits;

mod progress_tracker;

pub mod mocks;

use image::{ImageFormat, RgbImage, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub use candidates::{CandidateSource, SelectionSettings};
pub use config::Config;
pub use errors::{Result, SpriteCutoutError};
pub use model::SamOnnx;
pub use progress_tracker::RunSummary;
pub use traits::*;

use maskops::{
    alpha_metrics, apply_alpha, edge_guided_refine, keep_main_components, refine_alpha,
};
use progress_tracker::ProgressTracker;
use prompts::UserPoints;

/// Diagnostics for one processed image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageReport {
    pub source: CandidateSource,
    /// Foreground fraction of the final alpha, binarized at the alpha threshold.
    pub area: f64,
    pub border_touch: f64,
    pub seed_area: f64,
    pub candidates: usize,
    pub filtered: usize,
    pub escalated: bool,
}

pub struct SpriteCutter<O: SegmentationOracle> {
    oracle: O,
    config: Config,
}

impl<O: SegmentationOracle> SpriteCutter<O> {
    pub const fn new(oracle: O, config: Config) -> Self {
        Self { oracle, config }
    }

    pub const fn oracle(&self) -> &O {
        &self.oracle
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn process_directory(&self) -> Result<RunSummary> {
        let input_path = &self.config.input_dir;
        let output_path = &self.config.output_dir;

        if !input_path.is_dir() {
            return Err(SpriteCutoutError::FileSystem {
                path: input_path.clone(),
                operation: "ディレクトリ存在確認".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| SpriteCutoutError::FileSystem {
            path: output_path.clone(),
            operation: "ディレクトリ作成".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files()?;
        if image_files.is_empty() {
            return Err(SpriteCutoutError::Configuration {
                message: format!("no input images found in {}", input_path.display()),
            });
        }

        let mut tracker = ProgressTracker::new(image_files.len());
        for input_file in &image_files {
            match self.process_single_image(input_file) {
                Ok(report) => {
                    tracker.suspend(|| log_report(input_file, &report));
                    tracker.processed();
                }
                Err(e) if e.is_recoverable() => {
                    tracker.suspend(|| warn!(file = %input_file.display(), "skipped: {e}"));
                    tracker.skipped();
                }
                Err(e) => return Err(e),
            }
        }

        let summary = tracker.finish();
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            "done, outputs in {}",
            output_path.display()
        );
        Ok(summary)
    }

    /// Readable images under the input directory, sorted.
    pub fn collect_image_files(&self) -> Result<Vec<PathBuf>> {
        let mut image_files: Vec<PathBuf> = WalkDir::new(&self.config.input_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| is_readable_image(e.path()))
            .map(|e| e.into_path())
            .collect();
        image_files.sort();
        Ok(image_files)
    }

    pub fn process_single_image(&self, input_file: &Path) -> Result<ImageReport> {
        let image = image::open(input_file)
            .map_err(|e| SpriteCutoutError::ImageProcessing {
                path: input_file.display().to_string(),
                operation: "画像読み込み".to_string(),
                source: Box::new(e),
            })?
            .into_rgb8();

        let (cutout, report) = self.cutout_named(&image, &input_file.display().to_string())?;

        let output_file = self.output_path(input_file)?;
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| SpriteCutoutError::FileSystem {
                path: parent.to_path_buf(),
                operation: "出力ディレクトリ作成".to_string(),
                source: e,
            })?;
        }

        cutout
            .save_with_format(&output_file, self.config.output_format())
            .map_err(|e| SpriteCutoutError::ImageProcessing {
                path: output_file.display().to_string(),
                operation: "画像保存".to_string(),
                source: Box::new(e),
            })?;

        Ok(report)
    }

    /// Cuts the sprite out of an in-memory image.
    pub fn cutout(&self, image: &RgbImage) -> Result<(RgbaImage, ImageReport)> {
        self.cutout_named(image, "<memory>")
    }

    fn cutout_named(&self, image: &RgbImage, name: &str) -> Result<(RgbaImage, ImageReport)> {
        let (width, height) = image.dimensions();
        let user = UserPoints::resolve(&self.config.fg_points, &self.config.bg_points, width, height);
        let settings = self.config.selection_settings();

        let selection = candidates::select(&self.oracle, image, &user, &settings, name)?;

        let mut mask = keep_main_components(&selection.mask);
        if !self.config.no_edge_refine {
            // Refinement can leave detached fragments behind.
            mask = keep_main_components(&edge_guided_refine(image, &mask));
        }

        let alpha = refine_alpha(&mask, self.config.feather_sigma);
        let cutout = apply_alpha(image, &alpha)?;
        let (area, border_touch) = alpha_metrics(&alpha, self.config.alpha_threshold);

        Ok((
            cutout,
            ImageReport {
                source: selection.source,
                area,
                border_touch,
                seed_area: selection.seed_area,
                candidates: selection.candidate_count,
                filtered: selection.filtered_count,
                escalated: selection.escalated,
            },
        ))
    }

    /// Output location for `input_file`: same relative path, configured extension.
    pub fn output_path(&self, input_file: &Path) -> Result<PathBuf> {
        let relative = input_file
            .strip_prefix(&self.config.input_dir)
            .map_err(|_| SpriteCutoutError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "相対パス取得".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is outside the input directory",
                ),
            })?;
        Ok(self
            .config
            .output_dir
            .join(relative)
            .with_extension(&self.config.format))
    }
}

// ONNX Runtime の Segment Anything を使うコンストラクタ
impl SpriteCutter<SamOnnx> {
    pub fn with_sam(config: Config) -> Result<Self> {
        let oracle = SamOnnx::new(
            &config.encoder,
            &config.decoder,
            config.device_id,
            config.num_threads,
            config.automatic_config(),
        )?;
        Ok(Self::new(oracle, config))
    }
}

pub fn is_readable_image(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}

fn log_report(path: &Path, report: &ImageReport) {
    info!(
        file = %path.display(),
        source = %report.source,
        area = format_args!("{:.3}", report.area),
        border_touch = format_args!("{:.3}", report.border_touch),
        seed_area = format_args!("{:.3}", report.seed_area),
        candidates = report.candidates,
        filtered = report.filtered,
        escalated = report.escalated,
        "cut out"
    );
}
