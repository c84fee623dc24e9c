//! Platform-specific path utilities.
//!
//! Sockets and lock files share one per-user runtime directory:
//! - **Linux**: `$XDG_RUNTIME_DIR/pipehub`, falling back to `/tmp/pipehub`
//! - **macOS / Windows**: `<temp dir>/pipehub`

use crate::config::TransportConfig;
use crate::{RelayError, Result};
use std::path::{Path, PathBuf};

/// Default directory for endpoint sockets and lock files.
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(TransportConfig::RUNTIME_DIR_NAME)
}

/// Create `dir` (and parents) if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| RelayError::io_with_path(e, dir))?;
    }
    Ok(())
}

/// Path of the lock file backing the named lock `name`.
pub fn lock_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", sanitize(name)))
}

/// Keep names usable as a single path component.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
