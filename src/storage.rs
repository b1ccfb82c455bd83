//! Storage collaborator: an opaque byte-blob provider with a reported
//! modification time, used by the optimistic concurrency check at save.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use rand::{thread_rng, RngCore};

use crate::error::Result;

pub trait Storage {
    /// Load the whole container image.
    fn load(&self) -> Result<Vec<u8>>;

    /// Replace the container image with `data` in one commit.
    fn save(&self, data: &[u8]) -> Result<()>;

    /// Last external modification time, if the medium reports one.
    fn modified_time(&self) -> Result<Option<SystemTime>>;
}

/// File-backed storage. Saves go through a uniquely named temporary file in
/// the same directory, fsync, then an atomic rename, so a crash leaves
/// either the old or the new image, never a partial write.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn random_tmp_path(&self) -> PathBuf {
        let mut suffix = [0u8; 8];
        thread_rng().fill_bytes(&mut suffix);
        let hex: String = suffix.iter().map(|b| format!("{:02x}", b)).collect();
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".into());
        self.path.with_file_name(format!("{}.tmp.{}", file_name, hex))
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    fn save(&self, data: &[u8]) -> Result<()> {
        let tmp_path = self.random_tmp_path();
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        tmp_file.write_all(data)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn modified_time(&self) -> Result<Option<SystemTime>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.modified().ok()),
            // A path with no file yet has no timestamp to report
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    data: Option<Vec<u8>>,
    modified: Option<SystemTime>,
}

/// In-memory storage with an explicit modification clock. Clones share the
/// same blob, letting tests snapshot bytes and simulate an external writer.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current image, if any, without going through `load`.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.lock().data.clone()
    }

    /// Overwrite the stored bytes without advancing the modification clock.
    pub fn set_bytes(&self, data: Vec<u8>) {
        self.lock().data = Some(data);
    }

    /// Advance the modification clock as an external writer would.
    pub fn touch(&self) {
        let mut inner = self.lock();
        let base = inner.modified.unwrap_or_else(SystemTime::now);
        inner.modified = Some(base + Duration::from_secs(1));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Vec<u8>> {
        self.lock().data.clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no container image stored").into()
        })
    }

    fn save(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.data = Some(data.to_vec());
        // Keep the clock strictly monotonic even on coarse system clocks
        let now = SystemTime::now();
        inner.modified = Some(match inner.modified {
            Some(prev) if prev >= now => prev + Duration::from_nanos(1),
            _ => now,
        });
        Ok(())
    }

    fn modified_time(&self) -> Result<Option<SystemTime>> {
        Ok(self.lock().modified)
    }
}
