use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{Result, SpriteCutoutError};

fn fs_error(path: &Path, operation: &str) -> impl FnOnce(std::io::Error) -> SpriteCutoutError {
    let path = path.to_path_buf();
    let operation = operation.to_string();
    move |source| SpriteCutoutError::FileSystem {
        path,
        operation,
        source,
    }
}

/// Files with `extension` anywhere under `dir`, relative to it and sorted.
fn output_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(SpriteCutoutError::FileSystem {
            path: dir.to_path_buf(),
            operation: "出力ディレクトリ読み込み".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "output directory does not exist",
            ),
        });
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    Ok(files)
}

/// Copies every output over the file at the same relative path in `replace_dir`,
/// backing the original up into `backup_dir` first. Outputs without a counterpart
/// are ignored.
///
/// Returns the number of replaced files.
pub fn replace_outputs(
    output_dir: &Path,
    replace_dir: &Path,
    backup_dir: &Path,
    extension: &str,
) -> Result<usize> {
    let outputs = output_files(output_dir, extension)?;
    fs::create_dir_all(backup_dir).map_err(fs_error(backup_dir, "バックアップディレクトリ作成"))?;

    let mut replaced = 0;
    for relative in outputs {
        let target = replace_dir.join(&relative);
        if !target.is_file() {
            debug!(file = %target.display(), "no file to replace");
            continue;
        }

        let backup = backup_dir.join(&relative);
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent).map_err(fs_error(parent, "バックアップディレクトリ作成"))?;
        }
        fs::copy(&target, &backup).map_err(fs_error(&backup, "バックアップ作成"))?;
        fs::copy(output_dir.join(&relative), &target).map_err(fs_error(&target, "ファイル置換"))?;
        replaced += 1;
    }

    info!(
        replaced,
        backup = %backup_dir.display(),
        "replaced outputs in {}",
        replace_dir.display()
    );
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_with_backup() -> Result<()> {
        let temp = TempDir::new()?;
        let output = temp.path().join("output");
        let target = temp.path().join("sprites");
        let backup = temp.path().join("backup");
        fs::create_dir_all(&output)?;
        fs::create_dir_all(&target)?;

        fs::write(output.join("a.png"), b"new-a")?;
        fs::write(output.join("b.png"), b"new-b")?;
        fs::write(output.join("notes.txt"), b"skip")?;
        fs::write(target.join("a.png"), b"old-a")?;
        fs::write(target.join("notes.txt"), b"keep")?;

        let replaced = replace_outputs(&output, &target, &backup, "png")?;
        assert_eq!(replaced, 1);
        assert_eq!(fs::read(target.join("a.png"))?, b"new-a");
        assert_eq!(fs::read(backup.join("a.png"))?, b"old-a");
        assert!(!target.join("b.png").exists());
        assert_eq!(fs::read(target.join("notes.txt"))?, b"keep");
        Ok(())
    }

    #[test]
    fn test_replace_nested_outputs_with_format() -> Result<()> {
        let temp = TempDir::new()?;
        let output = temp.path().join("output");
        let target = temp.path().join("sprites");
        let backup = temp.path().join("backup");
        fs::create_dir_all(output.join("hero"))?;
        fs::create_dir_all(target.join("hero"))?;

        fs::write(output.join("hero").join("idle.webp"), b"new-idle")?;
        fs::write(output.join("hero").join("run.png"), b"new-run")?;
        fs::write(target.join("hero").join("idle.webp"), b"old-idle")?;
        fs::write(target.join("hero").join("run.png"), b"old-run")?;

        let replaced = replace_outputs(&output, &target, &backup, "webp")?;
        assert_eq!(replaced, 1);
        assert_eq!(fs::read(target.join("hero").join("idle.webp"))?, b"new-idle");
        assert_eq!(fs::read(backup.join("hero").join("idle.webp"))?, b"old-idle");
        assert_eq!(fs::read(target.join("hero").join("run.png"))?, b"old-run");
        Ok(())
    }

    #[test]
    fn test_missing_output_dir() -> Result<()> {
        let temp = TempDir::new()?;
        let result = replace_outputs(
            &temp.path().join("missing"),
            temp.path(),
            &temp.path().join("backup"),
            "png",
        );
        assert!(matches!(result, Err(SpriteCutoutError::FileSystem { .. })));
        Ok(())
    }
}
