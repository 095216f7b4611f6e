//! File-based key-value store for persistent storage.

use crate::error::{KvError, KvResult};
use crate::store::KvStore;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-based key-value store.
///
/// Each key maps to one file under the root directory. Values survive
/// process restarts, which is what makes outbox crash recovery and the
/// cross-process lock meaningful.
///
/// # Durability
///
/// Writes go to a temporary file which is fsynced and then renamed over
/// the target, so a crash mid-write leaves either the old value or the
/// new one, never a torn file.
///
/// # Keys
///
/// Keys may contain ASCII alphanumerics, `-`, `_`, `.` and `:` (`:` maps
/// to a path-safe character on disk). Anything else is rejected.
///
/// # Example
///
/// ```no_run
/// use driftsync_kv::{KvStore, FileKv};
/// use std::path::Path;
///
/// let kv = FileKv::open(Path::new("/var/lib/myapp/sync")).unwrap();
/// kv.set("cursor:main", b"42").unwrap();
/// ```
#[derive(Debug)]
pub struct FileKv {
    root: PathBuf,
    // Serializes the write-rename sequence per store.
    write_lock: Mutex<()>,
}

impl FileKv {
    /// Opens a file store rooted at the given directory, creating it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> KvResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> KvResult<PathBuf> {
        if key.is_empty() {
            return Err(KvError::InvalidKey("key cannot be empty".into()));
        }
        let ok = key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !ok {
            return Err(KvError::InvalidKey(format!(
                "key contains unsupported characters: {key}"
            )));
        }
        let file_name: String = key
            .chars()
            .map(|c| if c == ':' { '+' } else { c })
            .collect();
        Ok(self.root.join(file_name))
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> KvResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");

        let _guard = self.write_lock.lock();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
