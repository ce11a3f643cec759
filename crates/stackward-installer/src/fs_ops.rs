use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Copies `src` next to `dest` and renames it into place, so `dest` is
/// either the old file or the complete new one.
pub fn replace_file(src: &Path, dest: &Path, executable: bool) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", dest.display()))?;
    let staged = parent.join(format!(".{file_name}.stackward-new"));

    fs::copy(src, &staged).with_context(|| {
        format!(
            "failed to stage {} at {}",
            src.display(),
            staged.display()
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if executable {
            let mut permissions = fs::metadata(&staged)
                .with_context(|| format!("failed to stat {}", staged.display()))?
                .permissions();
            permissions.set_mode(0o755);
            fs::set_permissions(&staged, permissions).with_context(|| {
                format!("failed to set executable mode on {}", staged.display())
            })?;
        }
    }
    #[cfg(not(unix))]
    let _ = executable;

    if let Err(err) = fs::rename(&staged, dest) {
        let _ = fs::remove_file(&staged);
        return Err(err).with_context(|| {
            format!("failed to swap {} into {}", staged.display(), dest.display())
        });
    }
    Ok(())
}

/// Depth-first search for a regular file called `name` under `root`.
pub fn find_file_named(root: &Path, name: &str) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(root)
        .with_context(|| format!("failed to read {}", root.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", root.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in &entries {
        let path = entry.path();
        if path.is_file() && entry.file_name().to_str() == Some(name) {
            return Ok(Some(path));
        }
    }
    for entry in &entries {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_named(&path, name)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}
