//! Packaging of build output into a single zip archive.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::error::{PipelineError, Result};
use crate::runtime::Compression;

fn file_options(compression: Compression) -> SimpleFileOptions {
    let options = SimpleFileOptions::default().unix_permissions(0o644);
    match compression {
        Compression::None => options.compression_method(CompressionMethod::Stored),
        Compression::Standard => options.compression_method(CompressionMethod::Deflated),
        Compression::Maximum => options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9)),
    }
}

/// Zip every regular file below `src` into `dest`, returning the archive
/// size in bytes.
///
/// Entries are added in sorted order with `/`-separated relative names. The
/// archive is written to a temporary sibling and renamed into place, so an
/// existing archive at `dest` stays intact if packaging fails.
pub async fn package_directory(src: &Path, dest: &Path, compression: Compression) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || package_blocking(&src, &dest, compression))
        .await
        .map_err(|e| PipelineError::Storage(io::Error::other(e)))?
}

fn package_blocking(src: &Path, dest: &Path, compression: Compression) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = dest.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = dest.with_file_name(tmp_name);

    let written = write_archive(src, &tmp, compression);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, dest)?;
    Ok(std::fs::metadata(dest)?.len())
}

fn write_archive(src: &Path, archive: &Path, compression: Compression) -> Result<()> {
    let options = file_options(compression);
    let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(archive)?));
    for (name, path) in collect_files(src)? {
        writer.start_file(name, options)?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut writer)?;
    }
    writer.finish()?.flush()?;
    Ok(())
}

/// Regular files below `root` as (archive name, path), sorted by name.
/// Symlinks are skipped.
fn collect_files(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((name, path));
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(archive: &Path) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn build_output(dir: &Path) {
        std::fs::create_dir_all(dir.join("js/lib")).unwrap();
        std::fs::write(dir.join("index.html"), "<html></html>".repeat(200)).unwrap();
        std::fs::write(dir.join("js/game.js"), "let x = 1;".repeat(500)).unwrap();
        std::fs::write(dir.join("js/lib/engine.js"), "void 0;").unwrap();
    }

    #[tokio::test]
    async fn packages_nested_output_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export");
        build_output(&out);
        let zip_path = dir.path().join("exports/game.zip");

        let size = package_directory(&out, &zip_path, Compression::Standard)
            .await
            .unwrap();
        assert_eq!(size, std::fs::metadata(&zip_path).unwrap().len());
        assert_eq!(
            entries(&zip_path),
            ["index.html", "js/game.js", "js/lib/engine.js"]
        );
    }

    #[tokio::test]
    async fn stored_archives_are_larger_than_deflated() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export");
        build_output(&out);

        let stored = package_directory(&out, &dir.path().join("a.zip"), Compression::None)
            .await
            .unwrap();
        let max = package_directory(&out, &dir.path().join("b.zip"), Compression::Maximum)
            .await
            .unwrap();
        assert!(stored > max, "stored {stored} <= deflated {max}");
    }

    #[tokio::test]
    async fn missing_source_keeps_previous_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("game.zip");
        std::fs::write(&zip_path, b"previous").unwrap();

        let result =
            package_directory(&dir.path().join("nope"), &zip_path, Compression::Standard).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read(&zip_path).unwrap(), b"previous");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
