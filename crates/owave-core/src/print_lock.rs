use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("print lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Cross-process mutual exclusion over the shared terminal.
///
/// Backed by an advisory `flock` on a file, so every process must `open` its
/// own handle; handles inherited across `fork` share one lock and do not
/// exclude each other.
pub struct PrintLock {
    file: File,
    path: PathBuf,
}

impl PrintLock {
    /// Creates (or truncates) the lock file and records the owner pid in it.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| io_error(&path, source))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        let metadata = format!("owner_pid={}\n", std::process::id());
        file.write_all(metadata.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| io_error(&path, source))?;
        Ok(Self { file, path })
    }

    /// Opens an existing lock created by the orchestrator.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` while another process holds the lock.
    pub fn try_acquire(&self) -> Result<Option<PrintGuard<'_>>, LockError> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(Some(PrintGuard { lock: self })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(io_error(&self.path, source)),
        }
    }

    pub fn acquire(&self) -> Result<PrintGuard<'_>, LockError> {
        self.file
            .lock_exclusive()
            .map_err(|source| io_error(&self.path, source))?;
        Ok(PrintGuard { lock: self })
    }

    pub fn remove(self) -> Result<(), LockError> {
        std::fs::remove_file(&self.path).map_err(|source| io_error(&self.path, source))
    }
}

pub struct PrintGuard<'a> {
    lock: &'a PrintLock,
}

impl Drop for PrintGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.file.unlock() {
            warn!(path = %self.lock.path.display(), error = %err, "print_lock_release_failed");
        }
    }
}

fn io_error(path: &Path, source: io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}
