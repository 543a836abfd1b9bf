//! Filesystem-backed platform implementations for the host emulator.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::storage::{StorageError, StorageResult};

use super::{Clock, RemovableMedium, SlotMedium};

/// Slot medium rooted at a host directory.
///
/// Slot paths are resolved relative to `root`, so `/cerberus/salt` maps to
/// `<root>/cerberus/salt`.
pub struct FsMedium {
    root: PathBuf,
}

impl FsMedium {
    /// Creates a medium rooted at `root`. The directory need not exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(StorageError::Medium(format!("invalid path {path}")));
        }
        Ok(self.root.join(relative))
    }
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        // Directory fsync is not supported everywhere; the rename is still atomic.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

impl SlotMedium for FsMedium {
    fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::medium(err)),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StorageError::medium)?;
        }
        let mut file = File::create(&path).map_err(StorageError::medium)?;
        file.write_all(bytes).map_err(StorageError::medium)?;
        file.sync_all().map_err(StorageError::medium)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if to.exists() {
            return Err(StorageError::Medium(format!(
                "{} already exists",
                to.display()
            )));
        }
        fs::rename(&from, &to).map_err(StorageError::medium)?;
        sync_parent(&to);
        Ok(())
    }

    fn replace(&self, from: &str, to: &str) -> StorageResult<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        fs::rename(&from, &to).map_err(StorageError::medium)?;
        sync_parent(&to);
        Ok(())
    }

    fn remove(&self, path: &str) -> StorageResult<bool> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::medium(err)),
        }
    }

    fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let entries = match fs::read_dir(self.resolve(dir)?) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::medium(err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StorageError::medium)?;
            if entry.file_type().map_err(StorageError::medium)?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn create_dir_all(&self, dir: &str) -> StorageResult<()> {
        fs::create_dir_all(self.resolve(dir)?).map_err(StorageError::medium)
    }
}

impl RemovableMedium for FsMedium {
    fn is_present(&self) -> bool {
        self.root.is_dir()
    }
}

/// Wall-clock backed [`Clock`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}
