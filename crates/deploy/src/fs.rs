//! File system utils.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context;
use sha2::{Digest, Sha256};

pub struct FsHandler;

impl FsHandler {
    /// Write `contents` to `path` through a sibling temp file and a rename, so
    /// readers never observe a partially written file.
    pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = Self::sibling(path, "tmp");
        std::fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(path = %path.display(), "File written atomically");
        Ok(())
    }

    /// `env/sepolia.json` + `bak` -> `env/sepolia.json.bak`
    pub fn sibling(path: &Path, extension: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }

    /// Time elapsed since the file was last modified.
    pub fn file_age(path: &Path) -> anyhow::Result<Duration> {
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to read modification time of {}", path.display()))?;

        // A file stamped in the future is treated as brand new.
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO))
    }

    /// Whether the file exists and was modified within `window`.
    pub fn modified_within(path: &Path, window: Duration) -> bool {
        match Self::file_age(path) {
            Ok(age) => age <= window,
            Err(_) => false,
        }
    }

    /// Hex-encoded SHA-256 digest of a byte slice.
    pub fn digest(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}
