//! File staging into the mounted root: interpreter binary and project copies.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Copy the host's static user-mode interpreter into `<root>/<dest_dir>/`.
///
/// Returns the path of the installed copy.
pub fn install_interpreter(root: &Path, interpreter: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = match interpreter.file_name() {
        Some(name) => name,
        None => bail!("interpreter path has no file name: {}", interpreter.display()),
    };

    let dest_dir = root.join(strip_root(dest_dir));
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;

    let dest = dest_dir.join(name);
    fs::copy(interpreter, &dest).with_context(|| {
        format!(
            "copying {} to {}",
            interpreter.display(),
            dest.display()
        )
    })?;

    tracing::info!("installed {} into {}", interpreter.display(), dest.display());
    Ok(dest)
}

/// Recursively copy `src` into `dst`, recreating symlinks instead of
/// following them. Existing files in `dst` are overwritten.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("directory not found: {}", src.display());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.is_symlink() || target.exists() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("creating symlink {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copying {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    Ok(())
}

/// `"/opt/project"` -> `"opt/project"`, so it can be joined under a root.
pub fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
