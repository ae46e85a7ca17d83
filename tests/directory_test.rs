use std::fs;
use std::path::Path;

use clap::Parser;
use image::{ColorType, Rgb, RgbImage};
use tempfile::TempDir;

use sprite_cutout::mocks::{rect_mask, FixtureOracle};
use sprite_cutout::replace::replace_outputs;
use sprite_cutout::{Config, Result, RunSummary, ScoredMask, SpriteCutoutError, SpriteCutter};

fn config_for(input_dir: &Path, output_dir: &Path) -> Config {
    let mut config = Config::parse_from(["sprite-cutout", "in", "-e", "enc.onnx", "-m", "dec.onnx"]);
    config.input_dir = input_dir.to_path_buf();
    config.output_dir = output_dir.to_path_buf();
    config.no_edge_refine = true;
    config
}

fn square_oracle() -> FixtureOracle {
    FixtureOracle::new(
        vec![ScoredMask {
            mask: rect_mask(64, 64, 16, 16, 32, 32),
            confidence: 0.9,
        }],
        Vec::new(),
    )
}

fn write_sprite(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    RgbImage::from_pixel(64, 64, Rgb([30, 60, 90])).save(path)?;
    Ok(())
}

#[test]
fn test_process_directory_skips_unreadable_images() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");

    write_sprite(&input_dir.join("a.png"))?;
    write_sprite(&input_dir.join("sub").join("b.jpg"))?;
    fs::write(input_dir.join("broken.png"), b"not an image")?;
    fs::write(input_dir.join("notes.txt"), b"ignored")?;

    let cutter = SpriteCutter::new(square_oracle(), config_for(&input_dir, &output_dir));
    let summary = cutter.process_directory()?;
    assert_eq!(
        summary,
        RunSummary {
            processed: 2,
            skipped: 1
        }
    );

    let a = image::open(output_dir.join("a.png"))?;
    assert_eq!(a.color(), ColorType::Rgba8);
    let a = a.to_rgba8();
    assert_eq!(a.get_pixel(32, 32)[3], 255);
    assert_eq!(a.get_pixel(1, 1)[3], 0);
    assert!(output_dir.join("sub").join("b.png").exists());
    assert!(!output_dir.join("broken.png").exists());
    Ok(())
}

#[test]
fn test_images_are_processed_in_sorted_order() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    for name in ["c.png", "a.png", "b.png"] {
        write_sprite(&input_dir.join(name))?;
    }
    let cutter = SpriteCutter::new(square_oracle(), config_for(&input_dir, temp_dir.path()));
    let files = cutter.collect_image_files()?;
    let names: Vec<_> = files
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .collect();
    assert_eq!(names, ["a.png", "b.png", "c.png"]);
    Ok(())
}

#[test]
fn test_empty_seed_pool_skips_image() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");
    write_sprite(&input_dir.join("a.png"))?;

    let oracle = FixtureOracle::new(Vec::new(), Vec::new());
    let cutter = SpriteCutter::new(oracle, config_for(&input_dir, &output_dir));
    let summary = cutter.process_directory()?;
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.skipped, 1);
    assert!(!output_dir.join("a.png").exists());
    assert_eq!(cutter.oracle().automatic_calls(), 0);
    Ok(())
}

#[test]
fn test_no_images_is_an_error() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(&input_dir)?;
    fs::write(input_dir.join("readme.txt"), b"nothing here")?;

    let cutter = SpriteCutter::new(square_oracle(), config_for(&input_dir, temp_dir.path()));
    let result = cutter.process_directory();
    assert!(matches!(result, Err(SpriteCutoutError::Configuration { .. })));

    let missing = SpriteCutter::new(
        square_oracle(),
        config_for(&temp_dir.path().join("missing"), temp_dir.path()),
    );
    assert!(matches!(
        missing.process_directory(),
        Err(SpriteCutoutError::FileSystem { .. })
    ));
    Ok(())
}

#[test]
fn test_outputs_replace_originals_with_backup() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");
    let backup_dir = temp_dir.path().join("backup");
    write_sprite(&input_dir.join("hero.png"))?;

    let cutter = SpriteCutter::new(square_oracle(), config_for(&input_dir, &output_dir));
    cutter.process_directory()?;

    let replaced = replace_outputs(&output_dir, &input_dir, &backup_dir, "png")?;
    assert_eq!(replaced, 1);
    let backup = image::open(backup_dir.join("hero.png"))?;
    assert_eq!(backup.color(), ColorType::Rgb8);
    let replaced = image::open(input_dir.join("hero.png"))?;
    assert_eq!(replaced.color(), ColorType::Rgba8);
    Ok(())
}
