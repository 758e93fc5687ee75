//! Download and decompress a Raspberry Pi OS image.

use crate::process::{Cmd, CommandExecutor};
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_IMAGE_URL: &str = "https://downloads.raspberrypi.com/raspios_lite_arm64_latest";

const IMAGE_NAME: &str = "raspios.img";
const ARCHIVE_NAME: &str = "raspios.img.xz";
const PARTIAL_NAME: &str = "raspios.img.xz.part";

/// Ensure `<workdir>/raspios.img` exists, downloading and decompressing it
/// if needed. Existing files are reused.
pub fn fetch_image(
    exec: &dyn CommandExecutor,
    workdir: &Path,
    url: &str,
    sha256: Option<&str>,
) -> Result<PathBuf> {
    fs::create_dir_all(workdir)
        .with_context(|| format!("creating work directory '{}'", workdir.display()))?;

    let image = workdir.join(IMAGE_NAME);
    if image.exists() {
        tracing::info!("image already present, reusing {}", image.display());
        return Ok(image);
    }

    let archive = workdir.join(ARCHIVE_NAME);
    if archive.exists() {
        tracing::info!("archive {} present, reusing", archive.display());
    } else {
        download(exec, url, &workdir.join(PARTIAL_NAME), &archive)?;
    }

    if let Some(expected) = sha256 {
        verify_sha256(&archive, expected)?;
    }

    Cmd::new("xz")
        .arg("-dkf")
        .arg_path(&archive)
        .error_msg("xz decompression failed")
        .run(exec)?;

    if !image.exists() {
        let extracted = find_extracted_image(workdir)?;
        fs::rename(&extracted, &image).with_context(|| {
            format!(
                "renaming '{}' to '{}'",
                extracted.display(),
                image.display()
            )
        })?;
    }

    Ok(image)
}

/// Download into `partial` and move it to `archive` only once curl succeeds,
/// so an interrupted transfer is never mistaken for a complete archive.
fn download(
    exec: &dyn CommandExecutor,
    url: &str,
    partial: &Path,
    archive: &Path,
) -> Result<()> {
    tracing::info!("downloading {url}");
    // Foreground: progress on the terminal, and Ctrl-C stops the transfer.
    let cmd = Cmd::new("curl").args(["-fL", url, "-o"]).arg_path(partial);
    let out = exec.foreground(&cmd).context("Failed to run curl")?;
    if !out.success() {
        bail!("download of {url} failed: {}", out.failure_detail());
    }

    fs::rename(partial, archive).with_context(|| {
        format!(
            "renaming '{}' to '{}'",
            partial.display(),
            archive.display()
        )
    })?;
    Ok(())
}

fn find_extracted_image(workdir: &Path) -> Result<PathBuf> {
    let mut candidates = fs::read_dir(workdir)
        .with_context(|| format!("reading '{}'", workdir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "img"))
        .collect::<Vec<_>>();
    candidates.sort();

    match candidates.into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("no .img file found in {} after decompression", workdir.display()),
    }
}

/// Compare the SHA-256 of `path` against a hex digest.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file =
        fs::File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hashing '{}'", path.display()))?;
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "checksum mismatch for {}:\n  expected {}\n  actual   {}",
            path.display(),
            expected.trim(),
            actual
        );
    }
    tracing::info!("checksum ok for {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeExecutor;
    use tempfile::TempDir;

    #[test]
    fn test_existing_image_is_reused() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(IMAGE_NAME), b"img").unwrap();
        let exec = FakeExecutor::new();

        let image = fetch_image(&exec, temp.path(), DEFAULT_IMAGE_URL, None).unwrap();

        assert_eq!(image, temp.path().join(IMAGE_NAME));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_downloads_then_decompresses() {
        let temp = TempDir::new().unwrap();
        // curl is faked too; this is the file it would have written.
        fs::write(temp.path().join(PARTIAL_NAME), b"xz").unwrap();
        // xz is faked, so leave behind what it would have produced.
        fs::write(temp.path().join("2024-11-19-raspios-bookworm-arm64-lite.img"), b"x").unwrap();
        let exec = FakeExecutor::new();

        let image = fetch_image(&exec, temp.path(), "https://example.test/img", None).unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("curl -fL https://example.test/img -o "));
        assert!(calls[0].ends_with(PARTIAL_NAME));
        assert!(temp.path().join(ARCHIVE_NAME).is_file());
        assert!(!temp.path().join(PARTIAL_NAME).exists());
        assert!(calls[1].starts_with("xz -dkf "));
        assert!(image.exists());
        assert_eq!(image.file_name().unwrap(), IMAGE_NAME);
    }

    #[test]
    fn test_existing_archive_skips_download() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(ARCHIVE_NAME), b"xz").unwrap();
        fs::write(temp.path().join(IMAGE_NAME.replace("raspios", "other")), b"x").unwrap();
        let exec = FakeExecutor::new();

        fetch_image(&exec, temp.path(), DEFAULT_IMAGE_URL, None).unwrap();

        assert!(exec.calls_to("curl").is_empty());
        assert_eq!(exec.calls_to("xz").len(), 1);
    }

    #[test]
    fn test_sha256_verification() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        fs::write(&path, b"abc").unwrap();

        verify_sha256(
            &path,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert!(verify_sha256(&path, "00").is_err());
    }

    #[test]
    fn test_failed_download_is_an_error() {
        let temp = TempDir::new().unwrap();
        let exec = FakeExecutor::new();
        exec.fail_on("curl", "curl: (6) Could not resolve host");

        let err = fetch_image(&exec, temp.path(), DEFAULT_IMAGE_URL, None).unwrap_err();
        assert!(err.to_string().contains("download of"));
        assert!(exec.calls_to("xz").is_empty());
    }

    #[test]
    fn test_interrupted_download_is_not_reused() {
        let temp = TempDir::new().unwrap();
        // What a killed curl leaves behind.
        fs::write(temp.path().join(PARTIAL_NAME), b"truncated").unwrap();
        let exec = FakeExecutor::new();
        exec.fail_on("curl", "curl: (23) Failure writing output to destination");

        assert!(fetch_image(&exec, temp.path(), DEFAULT_IMAGE_URL, None).is_err());
        assert!(!temp.path().join(ARCHIVE_NAME).exists());

        // The next run downloads again instead of decompressing the fragment.
        let exec = FakeExecutor::new();
        fs::write(temp.path().join("raspios-lite.img"), b"x").unwrap();
        fetch_image(&exec, temp.path(), DEFAULT_IMAGE_URL, None).unwrap();
        assert_eq!(exec.calls_to("curl").len(), 1);
    }
}
