use anyhow::{ensure, Context, Result};
use image::ImageFormat;
use sprite_cutout::{replace::replace_outputs, Config, SpriteCutter};
use tracing::Level;

fn main() -> Result<()> {
    let config = Config::new();

    let log_level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    config.validate()?;
    ensure!(
        config.encoder.exists(),
        "Encoder model does not exist: {}",
        config.encoder.display()
    );
    ensure!(
        config.decoder.exists(),
        "Decoder model does not exist: {}",
        config.decoder.display()
    );
    ensure!(
        config.input_dir.is_dir(),
        "Input directory does not exist: {}",
        config.input_dir.display()
    );
    ensure!(
        ImageFormat::from_extension(&config.format).is_some_and(|f| f.writing_enabled()),
        "Invalid format"
    );

    let replace = config
        .replace_dir
        .clone()
        .map(|dir| (dir, config.backup_dir.clone()));
    let output_dir = config.output_dir.clone();
    let format = config.format.clone();

    let cutter = SpriteCutter::with_sam(config).context("Failed to load the segmentation model")?;
    cutter.process_directory()?;

    if let Some((replace_dir, backup_dir)) = replace {
        replace_outputs(&output_dir, &replace_dir, &backup_dir, &format)?;
    }

    Ok(())
}
