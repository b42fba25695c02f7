//! Atomic same-directory temp-file-then-rename writes (§4.4). Grounded on
//! the original write-back helper's `tempfile.mkstemp` + `os.replace`
//! pattern: the temp file lives beside the target so the final rename
//! never crosses a filesystem boundary, and it is removed on every error
//! path, including an unwinding panic, via a drop guard.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Writes `contents` to a temp file in the same directory as `target`, then
/// renames it into place. On any failure the original file is untouched
/// and the temp file is cleaned up.
pub fn atomic_rewrite(target: &Path, write_fn: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let dir = target.parent().context("target path has no parent directory")?;
    let file_name = target
        .file_name()
        .context("target path has no file name")?
        .to_string_lossy();
    let temp_path = dir.join(format!(".{file_name}.shipctl-tmp-{}", std::process::id()));

    let mut guard = TempFileGuard {
        path: temp_path.clone(),
        committed: false,
    };

    write_fn(&temp_path)?;

    fs::rename(&temp_path, target)
        .with_context(|| format!("rename temp file into place: {}", target.display()))?;
    guard.committed = true;
    Ok(())
}
