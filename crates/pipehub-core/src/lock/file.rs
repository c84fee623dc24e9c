//! OS file-lock backed named locks.
//!
//! Each name maps to `<dir>/<name>.lock`. Ownership is an exclusive advisory
//! lock on that file (`flock` on Unix, `LockFileEx` on Windows), which the
//! kernel drops when the owning process exits for any reason. The owner
//! writes its PID into the file and truncates it on a clean release, so a
//! non-empty file found by a new owner means the previous holder crashed.

use super::{Acquisition, HeldLock, LockGuard, LockProvider};
use crate::platform::paths::{ensure_dir, lock_file_path};
use crate::{RelayError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lock provider backed by files in one directory.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

impl FileLockProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_error(name: &str, path: &Path, err: std::io::Error) -> RelayError {
        RelayError::Lock {
            name: name.to_string(),
            path: path.to_path_buf(),
            message: err.to_string(),
            source: Some(err),
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockProvider for FileLockProvider {
    fn try_acquire(&self, name: &str) -> Result<Acquisition> {
        ensure_dir(&self.dir)?;
        let path = lock_file_path(&self.dir, name);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Self::lock_error(name, &path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(Acquisition::Contended),
            Err(e) => return Err(Self::lock_error(name, &path, e)),
        }

        let mut previous = String::new();
        file.read_to_string(&mut previous)
            .map_err(|e| Self::lock_error(name, &path, e))?;
        let previous = previous.trim();
        let reclaimed_from = (!previous.is_empty()).then(|| format!("pid {}", previous));

        stamp_owner(&mut file).map_err(|e| Self::lock_error(name, &path, e))?;

        Ok(Acquisition::Owner(LockGuard::new(
            name,
            Box::new(FileLock { file, path }),
            reclaimed_from,
        )))
    }
}

fn stamp_owner(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.sync_data()
}

#[derive(Debug)]
struct FileLock {
    file: File,
    path: PathBuf,
}

impl HeldLock for FileLock {
    fn release(&mut self) -> Result<()> {
        // Empty file = clean release; next owner won't report a reclaim.
        self.file
            .set_len(0)
            .map_err(|e| RelayError::io_with_path(e, &self.path))?;
        FileExt::unlock(&self.file).map_err(|e| RelayError::io_with_path(e, &self.path))
    }
}
