use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// File name of the server key inside the data directory.
pub const KEY_FILE_NAME: &str = "oncebox.key";

/// Resolve (and create) the data directory for Oncebox files
/// (`oncebox.db`, `secrets/`, `oncebox.key`).
///
/// Priority:
/// 1. an explicit path (CLI flag or `ONCEBOX_DATA_DIR`)
/// 2. platform-specific app data dir (`~/.local/share/oncebox/`, etc.)
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(dir) => dir.to_owned(),
        None => ProjectDirs::from("", "", "oncebox")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

/// Key file to load: the explicit path if given, else `<data_dir>/oncebox.key`.
pub fn key_file(explicit: Option<&Path>, data_dir: &Path) -> PathBuf {
    explicit
        .map(Path::to_owned)
        .unwrap_or_else(|| data_dir.join(KEY_FILE_NAME))
}
